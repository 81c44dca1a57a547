mod packing;
mod signing;
mod types;

pub use packing::{PackError, PackedUserOperation, hash_packed, pack, unpack, user_op_hash_v07};
pub use signing::{SignError, UserOpSigner, dummy_signature};
pub use types::{ENTRY_POINT_V07, UserOperation};
