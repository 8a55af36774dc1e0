//! Opt-in stderr diagnostics, controlled by environment variables so
//! deployed callers never pay for them:
//!
//! - `NMPC_DIAGNOSTICS=1` enables per-iteration lines
//! - `NMPC_DIAGNOSTICS_EVERY=n` logs every n-th iteration
//! - `NMPC_DIAGNOSTICS_KKT=1` adds linearized constraint movement

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub every: usize,
    pub print_kkt_residuals: bool,
}

impl DiagnosticsConfig {
    pub fn from_env() -> Self {
        let enabled = std::env::var("NMPC_DIAGNOSTICS")
            .map(|v| v == "1")
            .unwrap_or(false);
        let every = std::env::var("NMPC_DIAGNOSTICS_EVERY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1);
        let print_kkt_residuals = std::env::var("NMPC_DIAGNOSTICS_KKT")
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            enabled,
            every,
            print_kkt_residuals,
        }
    }

    #[inline]
    pub fn should_log(&self, iter: usize) -> bool {
        self.enabled && iter % self.every == 0
    }
}
