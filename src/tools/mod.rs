pub mod calculator;
pub mod descriptor;
pub mod echo;
pub mod fetch;
pub mod launcher;
pub mod registry;
pub mod weather;

pub use calculator::CalculatorTool;
pub use descriptor::{SideEffectClass, ToolDescriptor, ToolOutput};
pub use echo::EchoTool;
pub use fetch::FetchPageTool;
pub use launcher::{default_app_paths, OpenApplicationTool, OpenWebsiteTool};
pub use registry::{catalog_json, RegistryError, Tool, ToolRegistry};
pub use weather::WeatherTool;
