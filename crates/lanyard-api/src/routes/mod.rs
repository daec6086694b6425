pub mod calls;
pub mod huddles;
pub mod ice;
