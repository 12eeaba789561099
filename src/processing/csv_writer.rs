use std::fs::File;
use std::io::{self, BufWriter, Write};

/// Write paired columns, e.g. an I-V curve.
pub fn write_xy(path: &str, x_name: &str, y_name: &str, x: &[f64], y: &[f64]) -> io::Result<()> {
    write_csv(path, &[x_name, y_name], &[x.to_vec(), y.to_vec()])
}

/// Write an arbitrary set of equal-length columns.
pub fn write_csv(path: &str, headers: &[&str], columns: &[Vec<f64>]) -> io::Result<()> {
    assert_eq!(headers.len(), columns.len());
    let rows = columns.first().map(|c| c.len()).unwrap_or(0);
    assert!(columns.iter().all(|c| c.len() == rows));

    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "{}", headers.join(","))?;
    for row in 0..rows {
        let line: Vec<String> = columns.iter().map(|c| format!("{:e}", c[row])).collect();
        writeln!(file, "{}", line.join(","))?;
    }
    Ok(())
}
