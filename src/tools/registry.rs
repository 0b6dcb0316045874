//! 工具注册表
//!
//! 由 tools/list 返回的 ToolDescriptor 构建，按名称 O(1) 查找，同时保留工具进程给出的顺序（用于 prompt）。
//! 每个会话构建一次，可通过 list_capabilities(force_refresh) 整体替换。

use std::collections::HashMap;

use crate::tools::schema::ToolDescriptor;

/// 工具注册表：有序列表 + 名称索引
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从发现结果构建；同名工具以后出现者为准
    pub fn from_tools(tools: Vec<ToolDescriptor>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.insert(tool);
        }
        registry
    }

    fn insert(&mut self, tool: ToolDescriptor) {
        if let Some(&idx) = self.by_name.get(&tool.name) {
            tracing::warn!(tool = %tool.name, "duplicate tool name from provider, replacing");
            self.tools[idx] = tool;
        } else {
            self.by_name.insert(tool.name.clone(), self.tools.len());
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
