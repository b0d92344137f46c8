use log::{debug, info};

/// Supplies the process identifier known to the host agent, if any.
pub trait PidResolver: Send + Sync {
    /// `None` or an empty string means "not available".
    fn external_pid(&self) -> Option<String>;
}

impl<F> PidResolver for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn external_pid(&self) -> Option<String> {
        self()
    }
}

/// Resolver for hosts without an external id; always falls back to the OS pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPid;

impl PidResolver for LocalPid {
    fn external_pid(&self) -> Option<String> {
        None
    }
}

/// External id first, the local OS process id otherwise.
pub fn resolve_process_id(resolver: &dyn PidResolver) -> String {
    match resolver.external_pid().filter(|pid| !pid.is_empty()) {
        Some(pid) => {
            debug!("using external PID {pid}");
            pid
        }
        None => {
            info!("external PID from agent is not available, using own PID");
            std::process::id().to_string()
        }
    }
}
