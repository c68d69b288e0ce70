use droidagent_adb::AdbError;
use tonic::Status;

use crate::display::{DisplayError, EncodeError};
use crate::emulator::EmulatorError;

pub(crate) fn adb_status(err: AdbError) -> Status {
    match &err {
        AdbError::Device(_) => Status::internal(err.to_string()),
        AdbError::ChunkTooLarge { .. } => Status::invalid_argument(err.to_string()),
        AdbError::DeviceTimeout => Status::deadline_exceeded(err.to_string()),
        _ if err.is_transport() => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

pub(crate) fn emulator_status(err: EmulatorError) -> Status {
    match err {
        EmulatorError::NotReady => Status::failed_precondition(err.to_string()),
        EmulatorError::Console(status) => status,
        EmulatorError::Adb(err) => adb_status(err),
        other => Status::internal(other.to_string()),
    }
}

pub(crate) fn display_status(err: DisplayError) -> Status {
    match err {
        DisplayError::Encode(EncodeError::Unsupported(_)) => Status::unimplemented(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}
