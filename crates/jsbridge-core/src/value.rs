//! Persistent value handles.
//!
//! A [`Value`] is a host-side handle to a script value that stays alive
//! across operations until it is released. Every handle belongs to exactly
//! one environment; the native reference it names lives in that
//! environment's table on the engine thread.
//!
//! Releasing is explicit through [`Value::release`] or implicit when the last
//! clone of a handle is dropped. Using a released handle is a contract
//! violation and panics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jsbridge_common::{BridgeError, ScriptException};

use crate::context::EnvShared;
use crate::exception::{self, Stage};
use crate::id::{EnvId, ValueId};
use crate::native;

/// Coarse classification of a script value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Symbol,
    Array,
    Function,
    Object,
}

impl ValueKind {
    pub(crate) fn of(value: &v8::Value) -> Self {
        if value.is_undefined() {
            Self::Undefined
        } else if value.is_null() {
            Self::Null
        } else if value.is_boolean() {
            Self::Boolean
        } else if value.is_number() {
            Self::Number
        } else if value.is_big_int() {
            Self::BigInt
        } else if value.is_string() {
            Self::String
        } else if value.is_symbol() {
            Self::Symbol
        } else if value.is_array() {
            Self::Array
        } else if value.is_function() {
            Self::Function
        } else {
            Self::Object
        }
    }

    /// Returns `true` for kinds that can carry fields.
    pub fn is_object(self) -> bool {
        matches!(self, Self::Array | Self::Function | Self::Object)
    }

    /// The name used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::BigInt => "bigint",
            Self::String => "string",
            Self::Symbol => "symbol",
            Self::Array => "array",
            Self::Function => "function",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON projection of a native value.
///
/// Values without a JSON form (`undefined`, functions, symbols) project to
/// the literal text `undefined`. Returns `None` if stringification threw.
pub(crate) fn json_projection<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Option<String> {
    if value.is_undefined() || value.is_function() || value.is_symbol() {
        return Some("undefined".to_owned());
    }
    v8::json::stringify(scope, value).map(|json| json.to_rust_string_lossy(scope))
}

/// Handle to a script value.
///
/// Clones share the same native reference: releasing through one clone
/// releases it for all of them.
#[derive(Clone)]
pub struct Value {
    handle: Arc<ValueHandle>,
}

struct ValueHandle {
    id: ValueId,
    env: Arc<EnvShared>,
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        self.env.release_value(self.id);
    }
}

impl Value {
    pub(crate) fn new(id: ValueId, env: Arc<EnvShared>) -> Self {
        Self {
            handle: Arc::new(ValueHandle { id, env }),
        }
    }

    pub(crate) fn id(&self) -> ValueId {
        self.handle.id
    }

    /// The environment this value belongs to.
    pub fn env_id(&self) -> EnvId {
        self.handle.env.id()
    }

    /// Returns `true` once the value has been released, explicitly or by
    /// destroying or clearing its environment.
    pub fn is_released(&self) -> bool {
        !self.handle.env.holds(self.handle.id)
    }

    /// Check the handle is usable and return its keys.
    fn live(&self) -> (EnvId, ValueId) {
        let env = &self.handle.env;
        env.ensure_active();
        assert!(
            env.holds(self.handle.id),
            "value {} of environment {} has been released",
            self.handle.id,
            env.id()
        );
        (env.id(), self.handle.id)
    }

    /// JSON text of the value.
    ///
    /// Values without a JSON form (`undefined`, functions) yield the text
    /// `undefined`.
    ///
    /// # Panics
    ///
    /// Panics if the value has been released.
    pub fn to_json(&self) -> Result<String, BridgeError> {
        let (env, id) = self.live();
        self.handle.env.engine().run(move |scope| {
            native::in_context(scope, env, |scope| {
                let tc = &mut v8::TryCatch::new(scope);
                let value = native::expect_value(tc, env, id);
                json_projection(tc, value).ok_or_else(|| exception::capture(tc, Stage::Run))
            })
        })
    }

    /// The value as a host string.
    ///
    /// Fails with [`BridgeError::TypeMismatch`] unless the value is a string.
    pub fn to_string(&self) -> Result<String, BridgeError> {
        let json = self.to_json()?;
        match serde_json::from_str::<serde_json::Value>(&json) {
            Ok(serde_json::Value::String(text)) => Ok(text),
            Ok(_) => Err(BridgeError::type_mismatch("string", self.kind().as_str())),
            Err(_) => Err(BridgeError::type_mismatch("string", json)),
        }
    }

    /// Classify the value.
    pub fn kind(&self) -> ValueKind {
        let (env, id) = self.live();
        self.handle.env.engine().run(move |scope| {
            native::in_context(scope, env, |scope| {
                ValueKind::of(&native::expect_value(scope, env, id))
            })
        })
    }

    /// Enumerate the enumerable fields of an object, including inherited
    /// ones, as fresh handles.
    ///
    /// Fails with [`BridgeError::TypeMismatch`] for non-object values.
    pub fn burst(&self) -> Result<HashMap<String, Value>, BridgeError> {
        let (env, id) = self.live();
        let fields = self.handle.env.engine().run(move |scope| {
            native::in_context(scope, env, |scope| {
                let tc = &mut v8::TryCatch::new(scope);
                let value = native::expect_value(tc, env, id);
                let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
                    return Err(BridgeError::type_mismatch(
                        "object",
                        ValueKind::of(&value).as_str(),
                    ));
                };

                let Some(keys) = object.get_property_names(tc, v8::GetPropertyNamesArgs::default())
                else {
                    return Err(exception::capture(tc, Stage::Run));
                };

                let mut locals = Vec::with_capacity(keys.length() as usize);
                for index in 0..keys.length() {
                    let Some(key) = keys.get_index(tc, index) else {
                        return Err(exception::capture(tc, Stage::Run));
                    };
                    let Some(field) = object.get(tc, key) else {
                        return Err(exception::capture(tc, Stage::Run));
                    };
                    locals.push((key.to_rust_string_lossy(tc), field));
                }

                // Nothing below can fail, so no reference is minted for a
                // burst that ends up reporting an error.
                let fields = locals
                    .into_iter()
                    .filter_map(|(name, field)| native::mint(tc, env, field).map(|id| (name, id)))
                    .collect::<Vec<_>>();
                Ok(fields)
            })
        })?;

        Ok(fields
            .into_iter()
            .map(|(name, id)| (name, self.handle.env.adopt(id)))
            .collect())
    }

    /// Read a single field of an object.
    ///
    /// Fails with [`BridgeError::FieldUndefined`] if the field is absent or
    /// holds `undefined`.
    pub fn get(&self, field: &str) -> Result<Value, BridgeError> {
        let mut fields = self.burst()?;
        match fields.remove(field) {
            Some(value) if value.kind() != ValueKind::Undefined => Ok(value),
            _ => Err(BridgeError::field_undefined(field)),
        }
    }

    /// Assign `value` to the field `field` of this object.
    ///
    /// On failure the handle keeps pointing at the unmodified reference.
    ///
    /// # Panics
    ///
    /// Panics if either handle has been released or `value` belongs to a
    /// different environment.
    pub fn set(&self, field: &str, value: &Value) -> Result<(), BridgeError> {
        let (env, id) = self.live();
        assert!(
            value.env_id() == env,
            "Cannot set field '{field}': value was generated from another environment ({} != {env})",
            value.env_id()
        );
        let (_, assigned_id) = value.live();
        let field = field.to_owned();

        self.handle.env.engine().run(move |scope| {
            native::in_context(scope, env, |scope| {
                let tc = &mut v8::TryCatch::new(scope);
                let target = native::expect_value(tc, env, id);
                let Ok(object) = v8::Local::<v8::Object>::try_from(target) else {
                    return Err(BridgeError::type_mismatch(
                        "object",
                        ValueKind::of(&target).as_str(),
                    ));
                };
                let assigned = native::expect_value(tc, env, assigned_id);
                let Some(key) = v8::String::new(tc, &field) else {
                    return Err(BridgeError::field_undefined(field));
                };

                match object.set(tc, key.into(), assigned) {
                    Some(true) => {
                        let anchored = native::reanchor(tc, env, id, object.into());
                        debug_assert!(anchored, "value {id} lost its native reference");
                        Ok(())
                    }
                    _ if tc.has_caught() || tc.has_terminated() => {
                        Err(exception::capture(tc, Stage::Run))
                    }
                    _ => Err(BridgeError::Exception(ScriptException::new(format!(
                        "Cannot set field '{field}'"
                    )))),
                }
            })
        })
    }

    /// Release the native reference.
    ///
    /// Fails with [`BridgeError::StaleHandle`] if it was already released.
    pub fn release(&self) -> Result<(), BridgeError> {
        if self.handle.env.release_value(self.handle.id) {
            Ok(())
        } else {
            Err(BridgeError::StaleHandle { what: "value" })
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.handle.id)
            .field("env_id", &self.env_id())
            .field("released", &self.is_released())
            .finish()
    }
}
