pub mod backup;
pub mod overlay;
pub mod system;
