/// Runtime configuration shared by every thread a [`crate::Kernl`] builds.
#[derive(Clone, Debug, PartialEq)]
pub struct KernlConfig {
    pub default_namespace: String,
    /// Handoff ceiling applied when a call does not supply its own.
    /// `None` leaves the chain unbounded.
    pub max_handoffs: Option<usize>,
    pub hook_channel_capacity: usize,
}

impl Default for KernlConfig {
    fn default() -> Self {
        Self {
            default_namespace: "kernl".to_string(),
            max_handoffs: None,
            hook_channel_capacity: 256,
        }
    }
}
