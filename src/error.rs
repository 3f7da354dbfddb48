//! Error type of the engine and its mapping onto toolbox `OSErr` codes.

use deku::DekuError;
use thiserror::Error;

/// Legacy toolbox status code. Zero is success.
pub type OsErr = i16;

pub const NO_ERR: OsErr = 0;

pub type Result<T> = std::result::Result<T, FsError>;

/// Every failure a File Manager call can report. Each variant corresponds to
/// exactly one `OSErr`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsError {
    #[error("Disk full")]
    DiskFull,
    #[error("No such volume")]
    NoSuchVolume,
    #[error("I/O error")]
    Io,
    #[error("Bad filename")]
    BadName,
    #[error("File not open")]
    FileNotOpen,
    #[error("End of file")]
    EndOfFile,
    #[error("Invalid position")]
    Position,
    #[error("Memory full")]
    MemoryFull,
    #[error("Too many files open")]
    TooManyFilesOpen,
    #[error("File not found")]
    FileNotFound,
    #[error("Disk is write-protected")]
    WriteProtected,
    #[error("File is locked")]
    FileLocked,
    #[error("Volume is locked")]
    VolumeLocked,
    #[error("File is busy")]
    FileBusy,
    #[error("Duplicate filename")]
    DuplicateName,
    #[error("File already open for writing")]
    OpenForWriting,
    #[error("Invalid parameter")]
    Param,
    #[error("Invalid reference number")]
    BadRefNum,
    #[error("Volume is offline")]
    VolumeOffline,
    #[error("Volume is already mounted")]
    VolumeOnline,
    #[error("Permission error")]
    Permission,
    #[error("Volume belongs to an external file system")]
    ExternalFileSystem,
    #[error("Bad master directory block")]
    BadMdb,
    #[error("Write permission error")]
    WritePermission,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Directory not found")]
    DirNotFound,
    #[error("Too many working directories")]
    TooManyWorkingDirs,
    #[error("Invalid move")]
    BadMove,
    #[error("Internal file system error")]
    Corrupt,
    #[error("B-tree record not found")]
    RecordNotFound,
    #[error("Not a file")]
    NotAFile,
    #[error("Extent out of range")]
    ExtentRange,
}

impl FsError {
    const CODES: [(FsError, OsErr); 32] = [
        (FsError::DiskFull, -34),
        (FsError::NoSuchVolume, -35),
        (FsError::Io, -36),
        (FsError::BadName, -37),
        (FsError::FileNotOpen, -38),
        (FsError::EndOfFile, -39),
        (FsError::Position, -40),
        (FsError::MemoryFull, -41),
        (FsError::TooManyFilesOpen, -42),
        (FsError::FileNotFound, -43),
        (FsError::WriteProtected, -44),
        (FsError::FileLocked, -45),
        (FsError::VolumeLocked, -46),
        (FsError::FileBusy, -47),
        (FsError::DuplicateName, -48),
        (FsError::OpenForWriting, -49),
        (FsError::Param, -50),
        (FsError::BadRefNum, -51),
        (FsError::VolumeOffline, -53),
        (FsError::VolumeOnline, -55),
        (FsError::Permission, -54),
        (FsError::ExternalFileSystem, -58),
        (FsError::BadMdb, -60),
        (FsError::WritePermission, -61),
        (FsError::OutOfMemory, -108),
        (FsError::DirNotFound, -120),
        (FsError::TooManyWorkingDirs, -121),
        (FsError::BadMove, -122),
        (FsError::Corrupt, -127),
        (FsError::RecordNotFound, -1300),
        (FsError::NotAFile, -1302),
        (FsError::ExtentRange, -5001),
    ];

    /// The toolbox status code for this error.
    pub fn os_err(self) -> OsErr {
        Self::CODES
            .iter()
            .find(|(err, _)| *err == self)
            .map(|(_, code)| *code)
            .unwrap_or(-36)
    }

    /// Inverse of [`FsError::os_err`]. `None` for success and unknown codes.
    pub fn from_os_err(code: OsErr) -> Option<FsError> {
        Self::CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(err, _)| *err)
    }
}

/// Collapse a result into the status code written to a parameter block.
pub fn status<T>(result: &Result<T>) -> OsErr {
    match result {
        Ok(_) => NO_ERR,
        Err(err) => err.os_err(),
    }
}

/// Human-readable text for a status code.
pub fn error_string(code: OsErr) -> String {
    if code == NO_ERR {
        return "No error".to_string();
    }
    match FsError::from_os_err(code) {
        Some(err) => err.to_string(),
        None => "Unknown error".to_string(),
    }
}

impl From<DekuError> for FsError {
    fn from(err: DekuError) -> Self {
        log::debug!("malformed on-disk structure: {err}");
        FsError::Corrupt
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::FileNotFound,
            std::io::ErrorKind::PermissionDenied => FsError::Permission,
            std::io::ErrorKind::AlreadyExists => FsError::DuplicateName,
            std::io::ErrorKind::OutOfMemory => FsError::MemoryFull,
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                FsError::Corrupt
            }
            _ => FsError::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_invertible() {
        for (err, code) in FsError::CODES {
            assert_eq!(err.os_err(), code);
            assert_eq!(FsError::from_os_err(code), Some(err));
        }
        assert_eq!(FsError::from_os_err(0), None);
        assert_eq!(FsError::from_os_err(-9999), None);
    }

    #[test]
    fn error_strings() {
        assert_eq!(error_string(0), "No error");
        assert_eq!(error_string(-43), "File not found");
        assert_eq!(error_string(-34), "Disk full");
        assert_eq!(error_string(-55), "Volume is already mounted");
        assert_eq!(error_string(1234), "Unknown error");
    }

    #[test]
    fn status_of_result() {
        assert_eq!(status(&Ok::<_, FsError>(())), NO_ERR);
        assert_eq!(status::<()>(&Err(FsError::DuplicateName)), -48);
    }

    #[test]
    fn platform_errors_map_to_status_codes() {
        let err: FsError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err, FsError::FileNotFound);
        let err: FsError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.os_err(), -36);
    }
}
