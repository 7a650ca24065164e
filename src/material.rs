//! Named material parameters and the store-pass material.
//!
//! A [`Material`] is a bag of typed parameters addressed by name, the shape
//! an editor or a shader binder works with. [`StorePassMaterial`] declares
//! the parameters the K-Buffer understands and converts them into a
//! [`MaterialEntry`] for the palette.

use std::collections::BTreeMap;

use crate::color::Color;
use crate::kbuffer::{MaterialEntry, MaterialRegistry};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Color(Color),
}

impl ParamValue {
    fn same_kind(&self, other: &ParamValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Clone, Debug)]
struct Param {
    value: ParamValue,
    min: Option<f32>,
    read_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Material {
    name: String,
    params: BTreeMap<String, Param>,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a parameter with its default value.
    pub fn declare(&mut self, name: &str, value: ParamValue) -> &mut Self {
        self.params.insert(
            name.to_string(),
            Param {
                value,
                min: None,
                read_only: false,
            },
        );
        self
    }

    /// Adds a float parameter that never goes below `min`.
    pub fn declare_min(&mut self, name: &str, value: f32, min: f32) -> &mut Self {
        self.params.insert(
            name.to_string(),
            Param {
                value: ParamValue::Float(value.max(min)),
                min: Some(min),
                read_only: false,
            },
        );
        self
    }

    fn declare_read_only(&mut self, name: &str, value: ParamValue) {
        self.params.insert(
            name.to_string(),
            Param {
                value,
                min: None,
                read_only: true,
            },
        );
    }

    /// Sets an existing parameter. Unknown names, read-only parameters and
    /// values of the wrong kind are rejected with a warning.
    pub fn set(&mut self, name: &str, value: ParamValue) -> bool {
        let Some(param) = self.params.get_mut(name) else {
            log::warn!("Material '{}' has no parameter '{}'", self.name, name);
            return false;
        };
        if param.read_only {
            log::warn!("Parameter '{}' of '{}' is read-only", name, self.name);
            return false;
        }
        if !param.value.same_kind(&value) {
            log::warn!(
                "Parameter '{}' of '{}' expects {:?}, got {:?}",
                name,
                self.name,
                param.value,
                value
            );
            return false;
        }
        param.value = match (value, param.min) {
            (ParamValue::Float(v), Some(min)) => ParamValue::Float(v.max(min)),
            (v, _) => v,
        };
        true
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.params.get(name).map(|p| p.value)
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            ParamValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            ParamValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_color(&self, name: &str) -> Option<Color> {
        match self.get(name)? {
            ParamValue::Color(v) => Some(v),
            _ => None,
        }
    }

    /// Parameter names in sorted order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
}

pub const MATERIAL_INDEX: &str = "MaterialIndex";
pub const BASE_COLOR: &str = "BaseColor";
pub const IS_TRANSLUCENT: &str = "IsTranslucent";
pub const TRANSLUCENT_COLOR: &str = "TranslucentColor";
pub const MAX_TRANSLUCENT_THICKNESS: &str = "MaxTranslucentThickness";

/// Material drawn into the K-Buffer.
///
/// Each instance takes a fresh index from the registry; the index is what
/// the store pass writes per fragment.
#[derive(Clone, Debug)]
pub struct StorePassMaterial {
    index: u32,
    material: Material,
}

impl StorePassMaterial {
    pub fn new(registry: &MaterialRegistry) -> Self {
        let index = registry.register();
        let mut material = Material::new(format!("StorePassMaterial#{index}"));
        material.declare_read_only(MATERIAL_INDEX, ParamValue::Int(index as i32));
        material
            .declare(BASE_COLOR, ParamValue::Color(Color::WHITE))
            .declare(IS_TRANSLUCENT, ParamValue::Bool(false))
            .declare(TRANSLUCENT_COLOR, ParamValue::Color(Color::WHITE))
            .declare_min(MAX_TRANSLUCENT_THICKNESS, 0.0, 0.0);
        log::debug!("registered store pass material {}", index);
        Self { index, material }
    }

    pub fn base_color(mut self, color: Color) -> Self {
        self.set_base_color(color);
        self
    }

    /// Makes the material translucent: thin parts show `base`, parts at
    /// least `max_thickness` thick show `color`.
    pub fn translucent(mut self, color: Color, max_thickness: f32) -> Self {
        self.set_translucent(true);
        self.set_translucent_color(color);
        self.set_max_translucent_thickness(max_thickness);
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set_base_color(&mut self, color: Color) {
        self.material.set(BASE_COLOR, ParamValue::Color(color));
    }

    pub fn set_translucent(&mut self, translucent: bool) {
        self.material.set(IS_TRANSLUCENT, ParamValue::Bool(translucent));
    }

    pub fn set_translucent_color(&mut self, color: Color) {
        self.material.set(TRANSLUCENT_COLOR, ParamValue::Color(color));
    }

    pub fn set_max_translucent_thickness(&mut self, thickness: f32) {
        self.material
            .set(MAX_TRANSLUCENT_THICKNESS, ParamValue::Float(thickness));
    }

    /// Generic parameter access, as used by editors.
    pub fn params(&self) -> &Material {
        &self.material
    }

    pub fn params_mut(&mut self) -> &mut Material {
        &mut self.material
    }

    /// Palette entry for the current parameter values.
    pub fn entry(&self) -> MaterialEntry {
        let defaults = MaterialEntry::default();
        MaterialEntry {
            base_color: self
                .material
                .get_color(BASE_COLOR)
                .unwrap_or(defaults.base_color),
            is_translucent: self
                .material
                .get_bool(IS_TRANSLUCENT)
                .unwrap_or(defaults.is_translucent),
            translucent_color: self
                .material
                .get_color(TRANSLUCENT_COLOR)
                .unwrap_or(defaults.translucent_color),
            max_translucent_thickness: self
                .material
                .get_float(MAX_TRANSLUCENT_THICKNESS)
                .unwrap_or(defaults.max_translucent_thickness),
        }
    }
}
