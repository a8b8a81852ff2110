//! Channels: the typed slots that carry state between supersteps
//!
//! Every channel kind is a variant of the closed [`Channel`] enum, so
//! checkpointing and restoring never needs dynamic dispatch or downcasting.
//!
//! | Variant          | Merge policy for one step's writes                   |
//! |------------------|------------------------------------------------------|
//! | `LastValue`      | last write in application order wins                 |
//! | `Topic`          | writes are appended (optionally across steps)        |
//! | `Ephemeral`      | value lives for exactly one step                     |
//! | `BinaryOperator` | writes are folded into the value with a reducer      |
//! | `NamedBarrier`   | available once every named writer has written        |
//!
//! Channel state only changes through [`Channel::update`] and
//! [`Channel::consume`], both driven by the engine's write-application step.

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Reducer used by [`Channel::BinaryOperator`]: `(current, update) -> merged`.
///
/// On the first write `current` is `Value::Null`.
pub type Reducer = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// A state slot with a fixed merge policy.
#[derive(Clone)]
pub enum Channel {
    LastValue {
        value: Option<Value>,
    },
    Topic {
        values: Vec<Value>,
        /// Keep values from earlier steps instead of replacing them
        accumulate: bool,
    },
    Ephemeral {
        value: Option<Value>,
        /// Reject more than one write per step
        guard: bool,
    },
    BinaryOperator {
        value: Option<Value>,
        reducer: Reducer,
    },
    NamedBarrier {
        names: BTreeSet<String>,
        seen: BTreeSet<String>,
    },
}

impl Channel {
    pub fn last_value() -> Self {
        Channel::LastValue { value: None }
    }

    pub fn topic(accumulate: bool) -> Self {
        Channel::Topic {
            values: Vec::new(),
            accumulate,
        }
    }

    pub fn ephemeral(guard: bool) -> Self {
        Channel::Ephemeral { value: None, guard }
    }

    pub fn binary_operator<F>(reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Channel::BinaryOperator {
            value: None,
            reducer: Arc::new(reducer),
        }
    }

    /// Numeric sum reducer
    pub fn sum() -> Self {
        Self::binary_operator(|a, b| match (a.as_i64(), b.as_i64()) {
            _ if a.is_null() => b,
            (Some(x), Some(y)) => x
                .checked_add(y)
                .map_or_else(|| Value::from(x as f64 + y as f64), Value::from),
            _ => Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        })
    }

    /// List append reducer; non-array operands are treated as one element
    pub fn append() -> Self {
        Self::binary_operator(|a, b| {
            let mut merged = match a {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            match b {
                Value::Array(items) => merged.extend(items),
                other => merged.push(other),
            }
            Value::Array(merged)
        })
    }

    pub fn named_barrier<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Channel::NamedBarrier {
            names: names.into_iter().map(Into::into).collect(),
            seen: BTreeSet::new(),
        }
    }

    /// Short name of the variant, used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Channel::LastValue { .. } => "last_value",
            Channel::Topic { .. } => "topic",
            Channel::Ephemeral { .. } => "ephemeral",
            Channel::BinaryOperator { .. } => "binary_operator",
            Channel::NamedBarrier { .. } => "named_barrier",
        }
    }

    /// Current value, or [`CheckpointError::EmptyChannel`].
    pub fn get(&self) -> Result<Value> {
        let empty = || CheckpointError::EmptyChannel(self.kind().to_string());
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value, .. }
            | Channel::BinaryOperator { value, .. } => value.clone().ok_or_else(empty),
            Channel::Topic { values, .. } => {
                if values.is_empty() {
                    Err(empty())
                } else {
                    Ok(Value::Array(values.clone()))
                }
            }
            Channel::NamedBarrier { names, seen } => {
                if names == seen {
                    Ok(Value::Null)
                } else {
                    Err(empty())
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value, .. }
            | Channel::BinaryOperator { value, .. } => value.is_some(),
            Channel::Topic { values, .. } => !values.is_empty(),
            Channel::NamedBarrier { names, seen } => names == seen,
        }
    }

    /// Merge one step's writes. Returns whether the channel changed.
    pub fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match self {
            Channel::LastValue { value } => match values.into_iter().last() {
                Some(last) => {
                    *value = Some(last);
                    Ok(true)
                }
                None => Ok(false),
            },
            Channel::Topic {
                values: current,
                accumulate,
            } => {
                let mut updated = false;
                if !*accumulate {
                    updated = !current.is_empty();
                    current.clear();
                }
                for value in values {
                    match value {
                        Value::Array(items) => current.extend(items),
                        other => current.push(other),
                    }
                    updated = true;
                }
                Ok(updated)
            }
            Channel::Ephemeral { value, guard } => {
                if values.is_empty() {
                    return Ok(value.take().is_some());
                }
                if *guard && values.len() > 1 {
                    return Err(CheckpointError::invalid_update(
                        "ephemeral channel can receive only one value per step",
                    ));
                }
                *value = values.into_iter().last();
                Ok(true)
            }
            Channel::BinaryOperator { value, reducer } => {
                if values.is_empty() {
                    return Ok(false);
                }
                let mut acc = value.take().unwrap_or(Value::Null);
                for update in values {
                    acc = reducer(acc, update);
                }
                *value = Some(acc);
                Ok(true)
            }
            Channel::NamedBarrier { names, seen } => {
                let mut updated = false;
                for value in values {
                    let name = value.as_str().ok_or_else(|| {
                        CheckpointError::invalid_update(format!(
                            "barrier expects writer names, got {value}"
                        ))
                    })?;
                    if !names.contains(name) {
                        return Err(CheckpointError::invalid_update(format!(
                            "barrier does not wait for `{name}`"
                        )));
                    }
                    updated |= seen.insert(name.to_string());
                }
                Ok(updated)
            }
        }
    }

    /// Called once a subscribed task ran. Returns whether the channel changed.
    pub fn consume(&mut self) -> bool {
        match self {
            Channel::NamedBarrier { names, seen } if names == seen => {
                seen.clear();
                true
            }
            _ => false,
        }
    }

    /// Serializable state, or `None` when there is nothing to persist.
    pub fn checkpoint(&self) -> Option<Value> {
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value, .. }
            | Channel::BinaryOperator { value, .. } => value.clone(),
            Channel::Topic { values, .. } => {
                (!values.is_empty()).then(|| Value::Array(values.clone()))
            }
            Channel::NamedBarrier { seen, .. } => (!seen.is_empty())
                .then(|| Value::Array(seen.iter().cloned().map(Value::String).collect())),
        }
    }

    /// New channel of the same kind and configuration, restored from `state`.
    pub fn from_checkpoint(&self, state: Option<Value>) -> Result<Channel> {
        let restored = match (self, state) {
            (Channel::LastValue { .. }, value) => Channel::LastValue { value },
            (Channel::Ephemeral { guard, .. }, value) => Channel::Ephemeral {
                value,
                guard: *guard,
            },
            (Channel::BinaryOperator { reducer, .. }, value) => Channel::BinaryOperator {
                value,
                reducer: Arc::clone(reducer),
            },
            (Channel::Topic { accumulate, .. }, state) => Channel::Topic {
                values: match state {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                },
                accumulate: *accumulate,
            },
            (Channel::NamedBarrier { names, .. }, state) => {
                let seen = match state {
                    None | Some(Value::Null) => BTreeSet::new(),
                    Some(Value::Array(items)) => items
                        .into_iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect(),
                    Some(other) => {
                        return Err(CheckpointError::Invalid(format!(
                            "barrier checkpoint must be a list, got {other}"
                        )))
                    }
                };
                Channel::NamedBarrier {
                    names: names.clone(),
                    seen,
                }
            }
        };
        Ok(restored)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::LastValue { value } => f.debug_struct("LastValue").field("value", value).finish(),
            Channel::Topic { values, accumulate } => f
                .debug_struct("Topic")
                .field("values", values)
                .field("accumulate", accumulate)
                .finish(),
            Channel::Ephemeral { value, guard } => f
                .debug_struct("Ephemeral")
                .field("value", value)
                .field("guard", guard)
                .finish(),
            Channel::BinaryOperator { value, .. } => f
                .debug_struct("BinaryOperator")
                .field("value", value)
                .field("reducer", &"<function>")
                .finish(),
            Channel::NamedBarrier { names, seen } => f
                .debug_struct("NamedBarrier")
                .field("names", names)
                .field("seen", seen)
                .finish(),
        }
    }
}

/// Instantiate live channels from their specs, restoring any state saved in `checkpoint`.
pub fn channels_from_checkpoint<'a, I>(specs: I, checkpoint: &Checkpoint) -> Result<HashMap<String, Channel>>
where
    I: IntoIterator<Item = (&'a String, &'a Channel)>,
{
    specs
        .into_iter()
        .map(|(name, spec)| {
            let state = checkpoint.channel_values.get(name).cloned();
            Ok((name.clone(), spec.from_checkpoint(state)?))
        })
        .collect()
}

/// Snapshot `channels` into a new checkpoint derived from `checkpoint`.
///
/// When `channels` is `None` the channel values of `checkpoint` are carried
/// over unchanged. The result always has a fresh id.
pub fn create_checkpoint(
    checkpoint: &Checkpoint,
    channels: Option<&HashMap<String, Channel>>,
) -> Checkpoint {
    let channel_values = match channels {
        Some(channels) => channels
            .iter()
            .filter_map(|(name, channel)| channel.checkpoint().map(|v| (name.clone(), v)))
            .collect(),
        None => checkpoint.channel_values.clone(),
    };
    let mut next = Checkpoint::new(
        Checkpoint::new_id(),
        channel_values,
        checkpoint.channel_versions.clone(),
        checkpoint.versions_seen.clone(),
    );
    next.updated_channels = checkpoint.updated_channels.clone();
    next
}
