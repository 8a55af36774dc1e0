//! Wall-clock accounting for the solver phases. Guards accumulate on
//! drop, so timing a block is one line and early returns stay covered.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfSection {
    FunctionEvals,
    KktAssembly,
    Factorization,
    BackSolve,
    Residuals,
}

#[derive(Debug, Clone, Default)]
pub struct PerfTimers {
    pub function_evals: Duration,
    pub kkt_assembly: Duration,
    pub factorization: Duration,
    pub back_solve: Duration,
    pub residuals: Duration,
}

impl PerfTimers {
    pub fn scoped(&mut self, section: PerfSection) -> PerfGuard<'_> {
        PerfGuard {
            section,
            start: Instant::now(),
            timers: self,
        }
    }

    fn add(&mut self, section: PerfSection, elapsed: Duration) {
        match section {
            PerfSection::FunctionEvals => self.function_evals += elapsed,
            PerfSection::KktAssembly => self.kkt_assembly += elapsed,
            PerfSection::Factorization => self.factorization += elapsed,
            PerfSection::BackSolve => self.back_solve += elapsed,
            PerfSection::Residuals => self.residuals += elapsed,
        }
    }

    pub fn total(&self) -> Duration {
        self.function_evals + self.kkt_assembly + self.factorization + self.back_solve
            + self.residuals
    }
}

pub struct PerfGuard<'a> {
    section: PerfSection,
    start: Instant,
    timers: &'a mut PerfTimers,
}

impl Drop for PerfGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.timers.add(self.section, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_accumulates_on_drop() {
        let mut timers = PerfTimers::default();
        {
            let _g = timers.scoped(PerfSection::FunctionEvals);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(timers.function_evals >= Duration::from_millis(1));
        assert_eq!(timers.factorization, Duration::ZERO);
        assert_eq!(timers.total(), timers.function_evals);
    }

    #[test]
    fn test_sections_accumulate_independently() {
        let mut timers = PerfTimers::default();
        {
            let _g = timers.scoped(PerfSection::Factorization);
        }
        {
            let _g = timers.scoped(PerfSection::BackSolve);
        }
        assert!(timers.total() >= timers.factorization + timers.back_solve);
    }
}
