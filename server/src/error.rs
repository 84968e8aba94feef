use std::{error::Error, fmt, io};

/// The server crate's result type.
pub type Result<T> = std::result::Result<T, ServerErr>;

/// Studio server failures.
///
/// Everything except `Io` at the acceptor boundary is recoverable: the
/// failure is reported to the client as an error event and no state is
/// left partially applied.
#[derive(Debug)]
pub enum ServerErr {
    Io(io::Error),
    /// A long-running command arrived while another one held the
    /// admission permit.
    Busy,
    /// A settings patch referenced a key outside the whitelist.
    UnknownSettingKey { key: String },
    /// A settings patch carried a value of the wrong shape.
    InvalidSettingValue { detail: String },
    /// The requested compute device cannot be probed.
    DeviceUnavailable { device: String },
    /// The dataset path does not exist on the server.
    DatasetPath { path: String },
    /// A command needs a loaded dataset first.
    MissingDataset,
    /// A structural edit or save arrived before any model exists.
    MissingModel,
    /// An edit region with non-finite or inverted bounds.
    InvalidRegion,
    /// Spherical-harmonics degree outside the supported range.
    InvalidShDegree { sh_degree: i64 },
    /// Model snapshot persistence failed.
    Snapshot { detail: String },
}

impl fmt::Display for ServerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerErr::Io(e) => write!(f, "io error: {e}"),
            ServerErr::Busy => {
                f.write_str("Please wait until the current operation is completed")
            }
            ServerErr::UnknownSettingKey { key } => {
                write!(f, "Key {key} from client not present in Settings")
            }
            ServerErr::InvalidSettingValue { detail } => {
                write!(f, "Invalid settings value: {detail}")
            }
            ServerErr::DeviceUnavailable { device } => {
                write!(f, "Device does not exist: {device}")
            }
            ServerErr::DatasetPath { path } => {
                write!(f, "Dataset path does not exist: {path}")
            }
            ServerErr::MissingDataset => f.write_str(
                "Cannot begin training until the dataset, model, and trainer are initialized",
            ),
            ServerErr::MissingModel => f.write_str("No model has been loaded yet"),
            ServerErr::InvalidRegion => {
                f.write_str("Region bounds must be finite with min <= max")
            }
            ServerErr::InvalidShDegree { sh_degree } => {
                write!(f, "SH degree is invalid: {sh_degree}")
            }
            ServerErr::Snapshot { detail } => write!(f, "Model snapshot failed: {detail}"),
        }
    }
}

impl Error for ServerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<ServerErr> for io::Error {
    fn from(value: ServerErr) -> Self {
        match value {
            ServerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
