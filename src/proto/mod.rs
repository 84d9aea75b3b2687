pub mod codec;
pub mod opcode;
