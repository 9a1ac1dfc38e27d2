//! Interface quantities exchanged between the fluid, solid and mesh domains.
//!
//! Every field is stored node-major: the `c` components of node `i` occupy entries
//! `i*c..(i+1)*c`. The node ordering is fixed for the whole run and shared by all domains.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single interface field as a flat vector of degrees of freedom.
pub type InterfaceVector = na::DVector<f64>;

/// A physics domain participating in the coupling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Mesh,
    Fluid,
    Solid,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Mesh, Domain::Fluid, Domain::Solid];

    pub fn name(self) -> &'static str {
        match self {
            Domain::Mesh => "mesh",
            Domain::Fluid => "fluid",
            Domain::Solid => "solid",
        }
    }

    /// Fields this domain reads at every sub-iteration.
    pub fn inputs(self) -> &'static [Field] {
        match self {
            Domain::Mesh => &[Field::Displacement],
            Domain::Fluid => &[Field::MeshDisplacement],
            Domain::Solid => &[Field::Traction, Field::WallShearStress],
        }
    }

    /// Fields this domain writes at every sub-iteration.
    ///
    /// Each field has exactly one producer.
    pub fn outputs(self) -> &'static [Field] {
        match self {
            Domain::Mesh => &[Field::MeshDisplacement],
            Domain::Fluid => &[Field::Traction, Field::WallShearStress],
            Domain::Solid => &[Field::Displacement],
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Domain {
    type Err = InterfaceError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.name() == s)
            .ok_or_else(|| InterfaceError::UnknownDomain(s.to_string()))
    }
}

/// Interface fields with names fixed by the exchange protocol.
///
/// The declaration order defines the layout of the flattened coupled vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Wall displacement computed by the solid.
    Displacement,
    /// Fluid mesh motion computed by the mesh domain.
    MeshDisplacement,
    /// Wall traction exerted by the fluid.
    Traction,
    /// Wall shear stress magnitude, the growth stimulus.
    #[serde(rename = "wss")]
    WallShearStress,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::Displacement,
        Field::MeshDisplacement,
        Field::Traction,
        Field::WallShearStress,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Displacement => "displacement",
            Field::MeshDisplacement => "mesh_displacement",
            Field::Traction => "traction",
            Field::WallShearStress => "wss",
        }
    }

    /// Number of components per node.
    pub fn components(self) -> usize {
        match self {
            Field::WallShearStress => 1,
            _ => 3,
        }
    }

    /// The domain responsible for computing this field.
    pub fn producer(self) -> Domain {
        match self {
            Field::Displacement => Domain::Solid,
            Field::MeshDisplacement => Domain::Mesh,
            Field::Traction | Field::WallShearStress => Domain::Fluid,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Field {
    type Err = InterfaceError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| InterfaceError::UnknownField(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum InterfaceError {
    #[error("Unknown domain: {0:?}")]
    UnknownDomain(String),
    #[error("Unknown field: {0:?}")]
    UnknownField(String),
    #[error("Missing field: {0}")]
    MissingField(Field),
    #[error("Field {field} has {actual} entries, expected {expected}")]
    SizeMismatch {
        field: Field,
        expected: usize,
        actual: usize,
    },
}

/// A bundle of interface fields for one coupling iteration.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct InterfaceState {
    num_nodes: usize,
    fields: BTreeMap<Field, InterfaceVector>,
}

impl InterfaceState {
    /// An empty bundle on an interface with `num_nodes` nodes.
    pub fn new(num_nodes: usize) -> Self {
        InterfaceState {
            num_nodes,
            fields: BTreeMap::new(),
        }
    }

    /// All fields set to uniform values.
    ///
    /// Fields missing from `initial` are zero.
    pub fn cold_start(num_nodes: usize, initial: &BTreeMap<Field, f64>) -> Self {
        let mut state = InterfaceState::new(num_nodes);
        for field in Field::ALL {
            let value = initial.get(&field).copied().unwrap_or(0.0);
            state.fields.insert(
                field,
                InterfaceVector::from_element(num_nodes * field.components(), value),
            );
        }
        state
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn get(&self, field: Field) -> Option<&InterfaceVector> {
        self.fields.get(&field)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    /// Inserts a field, checking that its length matches the interface.
    pub fn insert(&mut self, field: Field, values: InterfaceVector) -> Result<(), InterfaceError> {
        let expected = self.num_nodes * field.components();
        if values.len() != expected {
            return Err(InterfaceError::SizeMismatch {
                field,
                expected,
                actual: values.len(),
            });
        }
        self.fields.insert(field, values);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &InterfaceVector)> {
        self.fields.iter().map(|(&f, v)| (f, v))
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.fields.keys().copied()
    }

    /// Copies the requested fields into a new bundle.
    pub fn subset(&self, fields: &[Field]) -> Result<InterfaceState, InterfaceError> {
        let mut out = InterfaceState::new(self.num_nodes);
        for &field in fields {
            let values = self.get(field).ok_or(InterfaceError::MissingField(field))?;
            out.fields.insert(field, values.clone());
        }
        Ok(out)
    }

    /// Overwrites fields in `self` with all fields present in `other`.
    pub fn overlay(&mut self, other: &InterfaceState) {
        for (field, values) in other.iter() {
            self.fields.insert(field, values.clone());
        }
    }

    /// Total number of degrees of freedom across the given fields.
    pub fn num_dofs(&self, fields: &[Field]) -> usize {
        fields
            .iter()
            .map(|f| self.num_nodes * f.components())
            .sum()
    }

    /// Concatenates the given fields in order into one coupled vector.
    pub fn flatten(&self, fields: &[Field]) -> Result<InterfaceVector, InterfaceError> {
        let mut out = InterfaceVector::zeros(self.num_dofs(fields));
        let mut offset = 0;
        for &field in fields {
            let values = self.get(field).ok_or(InterfaceError::MissingField(field))?;
            out.rows_mut(offset, values.len()).copy_from(values);
            offset += values.len();
        }
        Ok(out)
    }

    /// Splits a coupled vector produced by [`flatten`](Self::flatten) back into fields.
    pub fn unflatten(
        num_nodes: usize,
        fields: &[Field],
        flat: &InterfaceVector,
    ) -> Result<InterfaceState, InterfaceError> {
        let mut state = InterfaceState::new(num_nodes);
        let expected = state.num_dofs(fields);
        if flat.len() != expected {
            return Err(InterfaceError::SizeMismatch {
                field: fields.first().copied().unwrap_or(Field::Displacement),
                expected,
                actual: flat.len(),
            });
        }
        let mut offset = 0;
        for &field in fields {
            let n = num_nodes * field.components();
            state
                .fields
                .insert(field, flat.rows(offset, n).into_owned());
            offset += n;
        }
        Ok(state)
    }
}
