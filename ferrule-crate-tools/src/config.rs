use std::{fs, path::Path};

use anyhow::Context;
use serde::de::DeserializeOwned;

/// 从 TOML 文件加载配置
pub fn load_toml<T, P>(path: P) -> anyhow::Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let content =
        fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
    toml::from_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path.as_ref()))
}

/// 从字符串解析 TOML 配置
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> anyhow::Result<T> {
    toml::from_str(content).context("解析 TOML 配置失败")
}
