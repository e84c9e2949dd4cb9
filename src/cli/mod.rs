pub(crate) mod command;
pub(crate) mod inspect;
pub(crate) mod listen;
pub(crate) mod send;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat, SessionOptions};
pub use self::listen::ListenArgs;
pub use self::send::SendArgs;
