//! File transfer over the chat data channel.
//!
//! A transfer is announced with a `fileMeta` message and followed by binary
//! chunk frames (`<transferId>|<bytes>`). The receiver assembles chunks in
//! arrival order, which the ordered channel guarantees is send order.

pub mod transfer;

pub use transfer::{
    new_transfer_id, save_download, BeginOutcome, ChunkOutcome, CompletedTransfer,
    IncomingTransfer, IncomingTransfers, TransferError,
};
