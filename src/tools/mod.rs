//! 工具层：Tool trait、注册表、执行器与内置工具（echo / shell）

pub mod echo;
pub mod executor;
pub mod registry;
pub mod shell;

pub use echo::EchoTool;
pub use executor::{RegistryExecutor, ToolExecutor, ToolResult};
pub use registry::{Tool, ToolRegistry};
pub use shell::ShellTool;
