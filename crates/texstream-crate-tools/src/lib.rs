//! texstream 工具集
//!
//! 目前只提供日志初始化：
//! - [`init_log::init_log`]: 程序入口使用，带颜色和时间戳
//! - [`init_log::init_test_log`]: 测试使用，可以被重复调用

pub mod init_log;
