/// The stage a worker is in; the CLI picks a bar color per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Read,
    Write,
    Hash,
    Verify,
}

/// Progress message sent from a tool to whoever renders it.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub item: String,
    pub worker_id: usize,
    pub phase: Phase,
}

impl WorkerStatus {
    pub fn new(progress: f32, item: &str, worker_id: usize, phase: Phase) -> Self {
        Self {
            progress,
            item: item.to_string(),
            worker_id,
            phase,
        }
    }
}
