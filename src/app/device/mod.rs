pub mod backup;
pub mod lifecycle;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::app::device::backup::BackupSource;
use crate::app::error::AppError;

/// Lifecycle states, in their forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl DeviceState {
    fn rank(self) -> u8 {
        match self {
            DeviceState::Created => 0,
            DeviceState::Starting => 1,
            DeviceState::Started => 2,
            DeviceState::Stopping => 3,
            DeviceState::Stopped => 4,
        }
    }

    /// States only advance forward, with one sanctioned exception: a started
    /// device re-enters `Starting` while it reboots.
    pub fn can_transition(from: DeviceState, to: DeviceState) -> bool {
        if from == DeviceState::Started && to == DeviceState::Starting {
            return true;
        }
        to.rank() > from.rank()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceState::Created => "created",
            DeviceState::Starting => "starting",
            DeviceState::Started => "started",
            DeviceState::Stopping => "stopping",
            DeviceState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Capability tag. The two kinds share the state machine and differ only in
/// which provisioning and restore steps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Physical,
    Emulated,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Physical => write!(f, "physical"),
            DeviceKind::Emulated => write!(f, "emulated"),
        }
    }
}

/// In-process representation of one controllable device.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub identifier: i64,
    pub name: String,
    pub kind: DeviceKind,
    state: DeviceState,
    backup: Option<BackupSource>,
}

impl DeviceHandle {
    pub(crate) fn new(
        identifier: i64,
        name: String,
        kind: DeviceKind,
        backup: Option<BackupSource>,
    ) -> Self {
        Self {
            identifier,
            name,
            kind,
            state: DeviceState::Created,
            backup,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn backup(&self) -> Option<&BackupSource> {
        self.backup.as_ref()
    }

    /// The serial adb addresses this device by. Physical devices are plugged
    /// in under their own serial; emulated ones answer on a console port.
    pub fn serial(&self) -> String {
        match self.kind {
            DeviceKind::Physical => self.name.clone(),
            DeviceKind::Emulated => format!("emulator-{}", self.identifier),
        }
    }

    pub(crate) fn advance(&mut self, to: DeviceState, trace_id: &str) -> Result<(), AppError> {
        if !DeviceState::can_transition(self.state, to) {
            return Err(AppError::state(
                format!(
                    "Device {} cannot move from {} to {}",
                    self.name, self.state, to
                ),
                trace_id,
            ));
        }
        self.state = to;
        Ok(())
    }
}
