//! Record type schemas
//!
//! A `SnapshotDescriptor` is the data-driven registry the codec consults:
//! it names the snapshot class, fixes the size of every dimension and lists
//! the storable fields in order. Sub-stores are keyed by the whole
//! descriptor, so a 3-atom and a 5-atom system of the same class end up in
//! different columns.

use crate::error::{Error, Result};
use crate::storage::file::VarType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// How a field changes when the snapshot is time-reversed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reversal {
    #[default]
    Invariant,
    /// Numeric sign flip (velocities, momenta)
    Negate,
    /// Logical not (direction flags)
    Toggle,
}

/// One storable attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub var_type: VarType,
    /// Dimension names, outermost first; empty for scalars
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub reversal: Reversal,
}

impl FieldDescriptor {
    pub fn new(name: &str, var_type: VarType, dimensions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            var_type,
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            reversal: Reversal::Invariant,
        }
    }

    /// 64-bit float field
    pub fn float(name: &str, dimensions: &[&str]) -> Self {
        Self::new(name, VarType::Float64, dimensions)
    }

    pub fn with_reversal(mut self, reversal: Reversal) -> Self {
        self.reversal = reversal;
        self
    }
}

/// Schema of one snapshot type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    class: String,
    dimensions: BTreeMap<String, usize>,
    fields: Vec<FieldDescriptor>,
}

impl SnapshotDescriptor {
    pub fn builder(class: &str) -> DescriptorBuilder {
        DescriptorBuilder {
            class: class.to_string(),
            dimensions: BTreeMap::new(),
            fields: Vec::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn dimensions(&self) -> &BTreeMap<String, usize> {
        &self.dimensions
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Concrete array shape of a field
    pub fn shape(&self, field: &FieldDescriptor) -> Result<Vec<usize>> {
        field
            .dimensions
            .iter()
            .map(|dim| {
                self.dimensions.get(dim).copied().ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "Field '{}' of {} uses undeclared dimension '{}'",
                        field.name, self.class, dim
                    ))
                })
            })
            .collect()
    }

    /// Check internal consistency; used by the builder and on reopen
    pub fn validate(&self) -> Result<()> {
        if self.class.is_empty() {
            return Err(Error::InvalidArgument("Descriptor class must not be empty".to_string()));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "Descriptor {} declares no fields",
                self.class
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "Descriptor {} has a field without a name",
                    self.class
                )));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::InvalidArgument(format!(
                    "Descriptor {} declares field '{}' twice",
                    self.class, field.name
                )));
            }
            if field.var_type == VarType::Uuid {
                return Err(Error::InvalidArgument(format!(
                    "Field '{}' cannot use the uuid column type",
                    field.name
                )));
            }
            let compatible = match field.reversal {
                Reversal::Invariant => true,
                Reversal::Negate => field.var_type.is_numeric(),
                Reversal::Toggle => field.var_type == VarType::Bool,
            };
            if !compatible {
                return Err(Error::InvalidArgument(format!(
                    "Field '{}' cannot apply {:?} reversal to {:?}",
                    field.name, field.reversal, field.var_type
                )));
            }
            self.shape(field)?;
        }
        Ok(())
    }
}

impl fmt::Display for SnapshotDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.class)?;
        for (i, (name, size)) in self.dimensions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, size)?;
        }
        write!(f, "}}")
    }
}

/// Builder for `SnapshotDescriptor`
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    class: String,
    dimensions: BTreeMap<String, usize>,
    fields: Vec<FieldDescriptor>,
}

impl DescriptorBuilder {
    pub fn dimension(mut self, name: &str, size: usize) -> Self {
        self.dimensions.insert(name.to_string(), size);
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn build(self) -> Result<Arc<SnapshotDescriptor>> {
        let descriptor = SnapshotDescriptor {
            class: self.class,
            dimensions: self.dimensions,
            fields: self.fields,
        };
        descriptor.validate()?;
        Ok(Arc::new(descriptor))
    }
}
