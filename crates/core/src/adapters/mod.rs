//! Built-in step adapters

pub mod noop;
pub mod shell;

pub use noop::NoopAdapter;
pub use shell::ShellAdapter;
