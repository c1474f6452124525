//! 配置校验模块
//!
//! 校验规则：
//! - 字段级约束由 `validator` derive 规则声明 (范围、下限)
//! - advertised_host 必须是可连接的单播地址
//! - 握手超时不得超过会话写超时的 10 倍

use std::net::IpAddr;

use ::validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};
use contracts::{StreamingConfig, StreamingError};

/// 握手超时与写超时之比的上限
const MAX_HANDSHAKE_RATIO: u64 = 10;

/// 校验 StreamingConfig 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(config: &StreamingConfig) -> Result<(), StreamingError> {
    validate_fields(config)?;
    validate_advertised_host(config)?;
    validate_handshake_timeout(config)?;
    Ok(())
}

/// 执行 derive 声明的字段级规则
fn validate_fields(config: &StreamingConfig) -> Result<(), StreamingError> {
    match config.validate() {
        Ok(()) => Ok(()),
        Err(errors) => {
            let (field, message) = first_violation(&errors, "")
                .unwrap_or_else(|| (String::from("config"), errors.to_string()));
            Err(StreamingError::config_validation(field, message))
        }
    }
}

/// 按字段名排序后取第一个违规项，保证报错稳定
fn first_violation(errors: &ValidationErrors, prefix: &str) -> Option<(String, String)> {
    let mut entries: Vec<_> = errors.errors().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in entries {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };

        let found = match kind {
            ValidationErrorsKind::Field(errors) => errors.first().map(|e| (path, describe(e))),
            ValidationErrorsKind::Struct(inner) => first_violation(inner, &path),
            ValidationErrorsKind::List(items) => items
                .iter()
                .find_map(|(index, inner)| first_violation(inner, &format!("{path}[{index}]"))),
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn describe(error: &ValidationError) -> String {
    if let Some(message) = &error.message {
        return message.to_string();
    }

    let bound = |name: &str| error.params.get(name).map(ToString::to_string);
    match (bound("value"), bound("min"), bound("max")) {
        (Some(value), Some(min), Some(max)) => {
            format!("must be between {min} and {max}, got {value}")
        }
        (Some(value), Some(min), None) => format!("must be >= {min}, got {value}"),
        (Some(value), None, Some(max)) => format!("must be <= {max}, got {value}"),
        _ => format!("failed '{}' check", error.code),
    }
}

/// 校验 token 中公布的主机地址
fn validate_advertised_host(config: &StreamingConfig) -> Result<(), StreamingError> {
    let Some(host) = config.server.advertised_host else {
        return Ok(());
    };

    if host.is_unspecified() {
        return Err(StreamingError::config_validation(
            "server.advertised_host",
            format!("{host} is not reachable by subscribers"),
        ));
    }
    if is_multicast(host) {
        return Err(StreamingError::config_validation(
            "server.advertised_host",
            format!("{host} is a multicast address"),
        ));
    }
    Ok(())
}

fn is_multicast(host: IpAddr) -> bool {
    match host {
        IpAddr::V4(addr) => addr.is_multicast() || addr.is_broadcast(),
        IpAddr::V6(addr) => addr.is_multicast(),
    }
}

/// 校验握手超时与写超时的比例
fn validate_handshake_timeout(config: &StreamingConfig) -> Result<(), StreamingError> {
    let server = &config.server;
    let limit = server.timeout_ms.saturating_mul(MAX_HANDSHAKE_RATIO);
    if server.handshake_timeout_ms > limit {
        return Err(StreamingError::config_validation(
            "server.handshake_timeout_ms",
            format!(
                "must be <= {limit} ({MAX_HANDSHAKE_RATIO}x timeout_ms), got {}",
                server.handshake_timeout_ms
            ),
        ));
    }
    Ok(())
}
