//! The crewd runtime: tool-pattern expansion, the bounded model↔tool
//! turn loop, the crew orchestrator that owns the agent set, and the
//! wake scheduler that dispatches agents whose durable wake time is due.

pub mod crew;
pub mod tools;
pub mod turn;
pub mod wake;

pub use crew::{ClientFactory, Crew, DefaultClientFactory};
pub use tools::{RegisteredTool, ToolRegistry};
pub use turn::{RunnerParts, TurnEvent, TurnRunner, MAX_ITERATIONS};
pub use wake::WakeScheduler;
