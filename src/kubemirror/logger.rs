/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::kubemirror::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock, PoisonError};

const SERVICE_NAME: &str = "kubemirror";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Json as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        0 => LogFormat::Text,
        _ => LogFormat::Json,
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    #[cfg_attr(test, allow(dead_code))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

/// Minimum level written; `None` silences the logger.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LevelFilter {
    Level(LogLevel),
    None,
}

impl LevelFilter {
    fn encode(self) -> u8 {
        match self {
            LevelFilter::Level(level) => level as u8,
            LevelFilter::None => u8::MAX,
        }
    }

    fn enables(self, level: LogLevel) -> bool {
        (level as u8) >= self.encode()
    }
}

static LOG_THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level_filter(filter: LevelFilter) {
    LOG_THRESHOLD.store(filter.encode(), Ordering::Relaxed);
}

pub fn enabled(level: LogLevel) -> bool {
    (level as u8) >= LOG_THRESHOLD.load(Ordering::Relaxed)
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace()
                || matches!(
                    c,
                    '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
                )
        });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if !enabled(level) {
        return;
    }
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let pid = std::process::id().to_string();
    let context = tracing::current_context();

    let line = match current_log_format() {
        LogFormat::Text => {
            let mut line = String::new();
            push_field(&mut line, "ts", &timestamp);
            push_field(&mut line, "level", level.as_str());
            push_field(&mut line, "service", SERVICE_NAME);
            push_field(&mut line, "component", component);
            push_field(&mut line, "pid", &pid);
            push_field(&mut line, "msg", message);
            if let Some(ctx) = context.as_ref() {
                if let Some(request_id) = ctx.request_id() {
                    push_field(&mut line, "request_id", request_id);
                }
                push_field(&mut line, "trace_id", ctx.trace_id());
                push_field(&mut line, "span_id", ctx.span_id());
            }
            for (key, value) in metadata {
                if key.is_empty() {
                    continue;
                }
                push_field(&mut line, key, value);
            }
            line
        }
        LogFormat::Json => {
            let mut payload = serde_json::Map::new();
            payload.insert("ts".into(), Value::String(timestamp));
            payload.insert("level".into(), Value::String(level.as_str().to_string()));
            payload.insert("service".into(), Value::String(SERVICE_NAME.to_string()));
            payload.insert("component".into(), Value::String(component.to_string()));
            payload.insert("pid".into(), Value::String(pid));
            payload.insert("msg".into(), Value::String(message.to_string()));
            if let Some(ctx) = context {
                if let Some(request_id) = ctx.request_id() {
                    payload.insert("request_id".into(), Value::String(request_id.to_string()));
                }
                payload.insert("trace_id".into(), Value::String(ctx.trace_id().to_string()));
                payload.insert("span_id".into(), Value::String(ctx.span_id().to_string()));
            }
            for (key, value) in metadata {
                if key.is_empty() {
                    continue;
                }
                payload.insert((*key).to_string(), Value::String((*value).to_string()));
            }
            Value::Object(payload).to_string()
        }
    };
    write_line(level, &line);
}

pub fn log_trace(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Trace, component, message, metadata);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let write_result = if level.is_stderr() {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", line)
    } else {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)
    };

    if let Err(error) = write_result {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "kubemirror: failed to write log line: {} (original: {})",
            error, line
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    test_log_store()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Lines captured so far whose text contains `needle`. Tests in the same
/// binary share the store, so callers filter by a distinctive fragment.
#[cfg(test)]
pub(crate) fn captured_logs(needle: &str) -> Vec<(LogLevel, String)> {
    test_log_store()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|(_, line)| line.contains(needle))
        .cloned()
        .collect()
}
