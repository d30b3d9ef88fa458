pub mod classifier;
pub mod process;
pub mod state_machine;
pub mod supervisor;
