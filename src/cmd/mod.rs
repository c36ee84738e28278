pub mod keygen;
pub mod push;
pub mod verify;
