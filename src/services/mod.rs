pub mod accounts;
pub mod compiler;
pub mod generator;
pub mod llm;
pub mod manifest;
pub mod planner;
pub mod progress;
pub mod writer;
