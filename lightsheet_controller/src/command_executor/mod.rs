pub mod camera;
pub mod daq;
pub mod stage;

use std::io;

pub(crate) fn unexpected_response() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "Unexpected response type")
}
