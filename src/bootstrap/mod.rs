pub mod setup;

pub use setup::{initialize_folder, initialize_logger};
