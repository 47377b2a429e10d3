//! `taskmasterd`'s supervision engine: the state machine governing each
//! managed program's life (spawn → run → exit → decide → restart|give-up|stop),
//! the per-instance monitoring loop, the restart policy evaluator, and the
//! graceful-then-forceful shutdown protocol.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod instance;
pub mod registry;
pub mod supervisor;
