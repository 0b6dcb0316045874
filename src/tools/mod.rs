//! 工具层：运行期发现的工具描述、参数校验与注册表（不硬编码任何能力列表）

pub mod registry;
pub mod schema;

pub use registry::ToolRegistry;
pub use schema::{render_tool_catalog, InputSchema, PrimitiveKind, ToolDescriptor};
