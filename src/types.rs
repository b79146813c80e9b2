use serde::{Deserialize, Serialize};

/// Device families a kernel can be registered for.
///
/// `Gpu` is a scheduling domain and registration target; no accelerator SDK
/// is linked here. Implementers register their kernels under it and the
/// scheduler orders them with streams and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for DeviceKind {
    fn default() -> Self {
        DeviceKind::Cpu
    }
}

/// Placement of an operator or tensor: device family, ordinal and stream.
///
/// Two ops need a cross-device event between them exactly when their
/// `sync_domain`s differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct DeviceOption {
    #[serde(default)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<i32>,
}

impl DeviceOption {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn gpu(index: i32) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            index,
            random_seed: None,
            stream_id: None,
        }
    }

    pub fn with_stream(mut self, stream_id: i32) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// The (kind, index, stream) triple that governs ordering. Ops whose
    /// domains match share a FIFO stream; anything else synchronizes via
    /// events.
    pub fn sync_domain(&self) -> (DeviceKind, i32, i32) {
        (self.kind, self.index, self.stream_id.unwrap_or(0))
    }

    pub fn same_domain(&self, other: &DeviceOption) -> bool {
        self.sync_domain() == other.sync_domain()
    }
}

impl std::fmt::Display for DeviceOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)?;
        if let Some(stream) = self.stream_id {
            write!(f, "/s{}", stream)?;
        }
        Ok(())
    }
}
