use crate::mscp::Message;
use crate::mscp::drive::Drive;

/// The port signalled a failure while fetching from the command ring. The
/// polling thread drops its queue and goes back to idle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RingError;

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error reading command ring")
    }
}

impl std::error::Error for RingError {}

/// The host-bus side of the controller: the register-level glue that owns
/// the command/response rings, host memory DMA and the attached drives.
/// The server core only ever talks to the bus through this.
pub trait Port: Send {
    /// Pull the next command from the command ring, surrendering ownership.
    /// `Ok(None)` is the end-of-ring sentinel.
    fn next_command(&mut self) -> Result<Option<Message>, RingError>;

    /// Post a completed message to the response ring. Returns false only if
    /// the ring is full, which the protocol handshake rules out.
    fn post_response(&mut self, message: Message) -> bool;

    /// DMA `count` bytes out of host memory. `None` on a host memory fault.
    fn dma_read(&mut self, address: u32, count: usize) -> Option<Vec<u8>>;

    /// DMA `data` into host memory. False on a host memory fault.
    fn dma_write(&mut self, address: u32, data: &[u8]) -> bool;

    fn controller_identifier(&self) -> u32;
    fn controller_class_model(&self) -> u16;

    fn drive_count(&self) -> usize;
    fn drive(&self, unit: u16) -> Option<&Drive>;
    fn drive_mut(&mut self, unit: u16) -> Option<&mut Drive>;
}
