//! Operation type registry.
//!
//! Built once at startup from a fixed list of descriptors and read-only
//! afterwards. Lookups tell unknown types apart from types that exist but
//! were disabled at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nodekeeper_core::{
    decode_payload, FieldError, OperationPayload, OperationRequest, RequestSchema,
    ValidationResult,
};

use super::executor::{Executor, ExecutorFactory};
use super::operation::EngineError;

/// Turns a schema-valid raw payload into its typed request.
pub type DecodeFn = fn(serde_json::Value) -> Result<OperationRequest, Vec<FieldError>>;

// ---------------------------------------------------------------------------
// OperationTypeDescriptor
// ---------------------------------------------------------------------------

/// Everything the engine needs to know about one operation type.
#[derive(Clone)]
pub struct OperationTypeDescriptor {
    name: &'static str,
    schema: RequestSchema,
    decode: DecodeFn,
    executor_factory: ExecutorFactory,
    exclusion_group: Option<&'static str>,
    enabled: bool,
}

impl OperationTypeDescriptor {
    /// Describes the type whose payload is `P`, enabled and in no exclusion group.
    #[must_use]
    pub fn of<P: OperationPayload>(
        factory: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: P::TYPE_NAME,
            schema: P::schema(),
            decode: decode_payload::<P>,
            executor_factory: Arc::new(factory),
            exclusion_group: None,
            enabled: true,
        }
    }

    /// At most one operation of `group` runs at a time.
    #[must_use]
    pub fn in_group(mut self, group: &'static str) -> Self {
        self.exclusion_group = Some(group);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn schema(&self) -> &RequestSchema {
        &self.schema
    }

    #[must_use]
    pub fn exclusion_group(&self) -> Option<&'static str> {
        self.exclusion_group
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn executor_factory(&self) -> &ExecutorFactory {
        &self.executor_factory
    }

    /// Validates `raw` against the schema, then decodes it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] listing every offending field.
    pub fn decode(&self, raw: serde_json::Value) -> Result<OperationRequest, EngineError> {
        let invalid = |errors| EngineError::Validation {
            type_name: self.name.to_string(),
            errors,
        };
        if let ValidationResult::Invalid { errors } = self.schema.validate(&raw) {
            return Err(invalid(errors));
        }
        (self.decode)(raw).map_err(invalid)
    }

    #[must_use]
    pub fn new_executor(&self) -> Box<dyn Executor> {
        (self.executor_factory)()
    }
}

impl fmt::Debug for OperationTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTypeDescriptor")
            .field("name", &self.name)
            .field("exclusion_group", &self.exclusion_group)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Immutable catalogue of operation types, fixed at startup.
///
/// Built once through [`OperationRegistry::builder`]; lookups afterwards are
/// lock-free reads. Listing order is registration order.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    by_name: HashMap<&'static str, usize>,
    descriptors: Vec<OperationTypeDescriptor>,
}

impl OperationRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up a submittable type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownType`] for unregistered names and
    /// [`EngineError::DisabledType`] for registered but disabled ones.
    pub fn lookup(&self, name: &str) -> Result<&OperationTypeDescriptor, EngineError> {
        let descriptor = self
            .by_name
            .get(name)
            .map(|&index| &self.descriptors[index])
            .ok_or_else(|| EngineError::UnknownType {
                name: name.to_string(),
            })?;
        if descriptor.enabled {
            Ok(descriptor)
        } else {
            Err(EngineError::DisabledType {
                name: name.to_string(),
            })
        }
    }

    /// Enabled types in registration order.
    pub fn enabled(&self) -> impl Iterator<Item = &OperationTypeDescriptor> {
        self.descriptors.iter().filter(|d| d.enabled)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Collects descriptors and rejects duplicate names.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: OperationRegistry,
}

impl RegistryBuilder {
    /// Adds a type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateType`] if the name is already taken.
    pub fn register(mut self, descriptor: OperationTypeDescriptor) -> Result<Self, EngineError> {
        let name = descriptor.name;
        if self.registry.by_name.contains_key(name) {
            return Err(EngineError::DuplicateType {
                name: name.to_string(),
            });
        }
        self.registry
            .by_name
            .insert(name, self.registry.descriptors.len());
        self.registry.descriptors.push(descriptor);
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> OperationRegistry {
        self.registry
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
