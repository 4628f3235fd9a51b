pub mod presence;
pub mod roster;
