//! 도메인 타입 정의.

pub mod execution;
pub mod market;
pub mod position;
pub mod provider;
pub mod signal;
