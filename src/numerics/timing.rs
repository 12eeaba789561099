//! Feature-gated phase timers for the nonlinear solve.
//!
//! With the `timing` feature the driver records residual assembly,
//! Jacobian assembly and linear-solve durations per Newton iteration;
//! without it every helper compiles to a passthrough.

#![allow(unused)]
use std::cell::RefCell;
use std::time::Duration;

#[derive(Default, Clone)]
pub struct TimingStats {
    pub residual_times: Vec<Duration>,
    pub jacobian_times: Vec<Duration>,
    pub linear_solve_times: Vec<Duration>,
    pub total_time: Duration,
}

impl TimingStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "timing")]
    pub fn print_summary(&self) {
        if self.jacobian_times.is_empty() {
            return;
        }
        let total_residual: Duration = self.residual_times.iter().sum();
        let total_jacobian: Duration = self.jacobian_times.iter().sum();
        let total_linear: Duration = self.linear_solve_times.iter().sum();
        let accounted = total_residual + total_jacobian + total_linear;
        let overhead = self.total_time.saturating_sub(accounted);

        println!("\n{}", "=".repeat(56));
        println!("{:^56}", "SOLVE TIMING SUMMARY");
        println!("{}", "=".repeat(56));
        println!("Total solve time:        {:.3}s", self.total_time.as_secs_f64());
        println!(
            "  Residual assembly:     {:>9.3}ms over {} calls",
            total_residual.as_secs_f64() * 1000.0,
            self.residual_times.len()
        );
        println!(
            "  Jacobian assembly:     {:>9.3}ms over {} calls",
            total_jacobian.as_secs_f64() * 1000.0,
            self.jacobian_times.len()
        );
        println!(
            "  Linear solve:          {:>9.3}ms over {} calls",
            total_linear.as_secs_f64() * 1000.0,
            self.linear_solve_times.len()
        );
        println!("  Overhead/other:        {:>9.3}ms", overhead.as_secs_f64() * 1000.0);
        println!("{}", "=".repeat(56));
    }

    #[cfg(not(feature = "timing"))]
    pub fn print_summary(&self) {}
}

#[cfg(feature = "timing")]
thread_local! {
    static TIMING_STATS: RefCell<TimingStats> = RefCell::new(TimingStats::new());
}

#[cfg(feature = "timing")]
pub fn reset_timing() {
    TIMING_STATS.with(|stats| {
        *stats.borrow_mut() = TimingStats::new();
    });
}

#[cfg(not(feature = "timing"))]
pub fn reset_timing() {}

macro_rules! record_fn {
    ($name:ident, $field:ident) => {
        #[cfg(feature = "timing")]
        pub fn $name<F, R>(f: F) -> R
        where
            F: FnOnce() -> R,
        {
            let start = std::time::Instant::now();
            let result = f();
            let elapsed = start.elapsed();
            TIMING_STATS.with(|stats| {
                stats.borrow_mut().$field.push(elapsed);
            });
            result
        }

        #[cfg(not(feature = "timing"))]
        pub fn $name<F, R>(f: F) -> R
        where
            F: FnOnce() -> R,
        {
            f()
        }
    };
}

record_fn!(record_residual, residual_times);
record_fn!(record_jacobian, jacobian_times);
record_fn!(record_linear_solve, linear_solve_times);

#[cfg(feature = "timing")]
pub fn finalize_and_print(total_time: Duration) {
    TIMING_STATS.with(|stats| {
        let mut s = stats.borrow_mut();
        s.total_time = total_time;
        s.print_summary();
    });
}

#[cfg(not(feature = "timing"))]
pub fn finalize_and_print(_total_time: Duration) {}
