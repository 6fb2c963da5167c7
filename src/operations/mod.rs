pub mod indexation;
