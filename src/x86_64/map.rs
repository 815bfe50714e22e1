// Copyright © 2026 The cpu-model Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The CPU catalog: vendors, features, and models, plus the visitor that
//! loads them from an external walker.

use serde::{Deserialize, Serialize};

use super::data::{CpuidLeaf, X86Data};
use super::Error;
use crate::{CpuDef, CpuType, FeaturePolicy};

/// The vendor identification string is always 12 ASCII bytes.
const VENDOR_STRING_LENGTH: usize = 12;

/// Raw properties of one `<cpuid>` element. Register values are hex strings;
/// a missing register defaults to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuidProps {
    pub function: Option<String>,
    #[serde(default)]
    pub eax: Option<String>,
    #[serde(default)]
    pub ebx: Option<String>,
    #[serde(default)]
    pub ecx: Option<String>,
    #[serde(default)]
    pub edx: Option<String>,
}

/// Raw properties of a vendor element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorProps {
    pub name: Option<String>,
    pub string: Option<String>,
}

/// Raw properties of a feature element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureProps {
    pub name: Option<String>,
    #[serde(default)]
    pub cpuid: Vec<CpuidProps>,
}

/// Raw properties of a model element. `model` names an ancestor that must
/// already be loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProps {
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// One element of the catalog stream, as handed over by the external walker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMapElement {
    Vendor(VendorProps),
    Feature(FeatureProps),
    Model(ModelProps),
}

/// The boundary to the external catalog walker.
///
/// An implementation visits every catalog element in document order. The
/// walk itself may fail (the catalog cannot be read at all); individual
/// malformed elements are reported and skipped by the visitor instead.
pub trait CpuMapSource {
    fn visit_elements(
        &self,
        visit: &mut dyn FnMut(CpuMapElement) -> Result<(), Error>,
    ) -> Result<(), Error>;
}

impl CpuMapSource for [CpuMapElement] {
    fn visit_elements(
        &self,
        visit: &mut dyn FnMut(CpuMapElement) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for element in self {
            visit(element.clone())?;
        }
        Ok(())
    }
}

impl CpuMapSource for Vec<CpuMapElement> {
    fn visit_elements(
        &self,
        visit: &mut dyn FnMut(CpuMapElement) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.as_slice().visit_elements(visit)
    }
}

/// A CPU vendor, identified by the 12-byte string it reports at leaf 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X86Vendor {
    pub name: String,
    pub cpuid: CpuidLeaf,
}

/// A named CPU feature and the CPUID bits that make it present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X86Feature {
    pub name: String,
    pub data: X86Data,
}

/// A named CPU model: the union of its ancestor's data and the features it
/// declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X86Model {
    pub name: String,
    pub vendor: Option<String>,
    pub data: X86Data,
}

/// The in-memory catalog. Owns all vendors, features, and models; every
/// lookup is linear and every scan runs in load order.
#[derive(Debug, Default)]
pub struct X86Map {
    vendors: Vec<X86Vendor>,
    features: Vec<X86Feature>,
    models: Vec<X86Model>,
}

fn parse_hex(value: &str) -> Option<u32> {
    u32::from_str_radix(value.strip_prefix("0x").unwrap_or(value), 16).ok()
}

/// A missing register reads as zero; a present but non-hex one is an error.
fn parse_register(value: &Option<String>) -> Option<u32> {
    match value {
        Some(value) => parse_hex(value),
        None => Some(0),
    }
}

fn read_le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl X86Map {
    /// Builds a catalog by walking `source`.
    ///
    /// Malformed or duplicate elements are reported through the log and
    /// skipped; the walk continues and the catalog stays usable.
    pub fn load<S: CpuMapSource + ?Sized>(source: &S) -> Result<X86Map, Error> {
        let mut map = X86Map::default();
        source.visit_elements(&mut |element| {
            map.load_element(element);
            Ok(())
        })?;
        Ok(map)
    }

    fn load_element(&mut self, element: CpuMapElement) {
        match element {
            CpuMapElement::Vendor(props) => self.load_vendor(props),
            CpuMapElement::Feature(props) => self.load_feature(props),
            CpuMapElement::Model(props) => self.load_model(props),
        }
    }

    fn load_vendor(&mut self, props: VendorProps) {
        let Some(name) = props.name else {
            error!("Missing CPU vendor name");
            return;
        };
        if self.vendor(&name).is_some() {
            error!("CPU vendor {name} already defined");
            return;
        }
        let Some(string) = props.string else {
            error!("Missing vendor string for CPU vendor {name}");
            return;
        };
        if string.len() != VENDOR_STRING_LENGTH {
            error!("Invalid CPU vendor string '{string}'");
            return;
        }

        let bytes = string.as_bytes();
        let cpuid = CpuidLeaf {
            function: 0,
            eax: 0,
            ebx: read_le32(&bytes[0..4]),
            edx: read_le32(&bytes[4..8]),
            ecx: read_le32(&bytes[8..12]),
        };
        self.vendors.push(X86Vendor { name, cpuid });
    }

    fn load_feature(&mut self, props: FeatureProps) {
        let Some(name) = props.name else {
            error!("Missing CPU feature name");
            return;
        };
        if self.feature(&name).is_some() {
            error!("CPU feature {name} already defined");
            return;
        }

        let mut data = X86Data::new();
        for (i, cpuid) in props.cpuid.iter().enumerate() {
            let registers = cpuid.function.as_deref().and_then(parse_hex).and_then(
                |function| {
                    Some(CpuidLeaf {
                        function,
                        eax: parse_register(&cpuid.eax)?,
                        ebx: parse_register(&cpuid.ebx)?,
                        ecx: parse_register(&cpuid.ecx)?,
                        edx: parse_register(&cpuid.edx)?,
                    })
                },
            );
            let Some(leaf) = registers else {
                error!("Invalid cpuid[{i}] in {name} feature");
                return;
            };
            data.add_leaf(&leaf);
        }
        self.features.push(X86Feature { name, data });
    }

    fn load_model(&mut self, props: ModelProps) {
        let Some(name) = props.name else {
            error!("Missing CPU model name");
            return;
        };
        if self.model(&name).is_some() {
            error!("CPU model {name} already defined");
            return;
        }

        let mut model = X86Model {
            name,
            ..Default::default()
        };

        if let Some(ancestor_name) = &props.model {
            let Some(ancestor) = self.model(ancestor_name) else {
                error!(
                    "Ancestor model {ancestor_name} not found for CPU model {}",
                    model.name
                );
                return;
            };
            model.vendor = ancestor.vendor.clone();
            model.data = ancestor.data.clone();
        }

        if let Some(vendor_name) = &props.vendor {
            if self.vendor(vendor_name).is_none() {
                error!(
                    "Unknown vendor {vendor_name} referenced by CPU model {}",
                    model.name
                );
                return;
            }
            model.vendor = Some(vendor_name.clone());
        }

        for feature_name in &props.features {
            let Some(feature) = self.feature(feature_name) else {
                error!(
                    "Feature {feature_name} required by CPU model {} not found",
                    model.name
                );
                return;
            };
            model.data.union_with(&feature.data);
        }

        self.models.push(model);
    }

    pub fn vendor(&self, name: &str) -> Option<&X86Vendor> {
        self.vendors.iter().find(|vendor| vendor.name == name)
    }

    pub fn feature(&self, name: &str) -> Option<&X86Feature> {
        self.features.iter().find(|feature| feature.name == name)
    }

    pub fn model(&self, name: &str) -> Option<&X86Model> {
        self.models.iter().find(|model| model.name == name)
    }

    pub fn vendors(&self) -> &[X86Vendor] {
        &self.vendors
    }

    pub fn features(&self) -> &[X86Feature] {
        &self.features
    }

    pub fn models(&self) -> &[X86Model] {
        &self.models
    }

    /// Finds the vendor whose identification leaf is covered by `data` and
    /// removes its bits, so vendor identification is never misread as
    /// features.
    pub fn vendor_from_data<'a>(&'a self, data: &mut X86Data) -> Option<&'a X86Vendor> {
        self.vendors
            .iter()
            .find(|vendor| data.strip_masked(&vendor.cpuid))
    }

    /// Moves every catalog feature wholly contained in `data` onto `cpu`
    /// with the given policy, removing its bits from `data` as it goes.
    /// Scans in catalog order.
    pub fn extract_features(
        &self,
        cpu: &mut CpuDef,
        policy: FeaturePolicy,
        data: &mut X86Data,
    ) -> Result<(), Error> {
        for feature in &self.features {
            if data.covers(&feature.data) {
                data.subtract(&feature.data);
                cpu.add_feature(&feature.name, Some(policy))?;
            }
        }
        Ok(())
    }

    /// Renders a separator-joined list of all catalog features fully
    /// contained in `data`, in catalog order.
    pub fn feature_names(&self, data: &X86Data, separator: &str) -> String {
        self.features
            .iter()
            .filter(|feature| data.covers(&feature.data))
            .map(|feature| feature.name.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }

    /// The union of all features listed on `cpu`, regardless of policy.
    pub fn data_from_cpu_features(&self, cpu: &CpuDef) -> Result<X86Data, Error> {
        let mut data = X86Data::new();
        for feature in &cpu.features {
            let found = self
                .feature(&feature.name)
                .ok_or_else(|| Error::UnknownFeature(feature.name.clone()))?;
            data.union_with(&found.data);
        }
        Ok(data)
    }

    /// Explains `data` in terms of `model`: the residual bits not covered by
    /// the model become REQUIRE features, the model bits missing from the
    /// data become DISABLE features, and vendor identification is stripped
    /// into the definition's vendor field.
    pub fn cpu_from_data(&self, data: &X86Data, model: &X86Model) -> Result<CpuDef, Error> {
        let mut cpu = CpuDef {
            model: Some(model.name.clone()),
            ..Default::default()
        };
        let mut copy = data.clone();
        let mut model_data = model.data.clone();

        if let Some(vendor) = self.vendor_from_data(&mut copy) {
            cpu.vendor = Some(vendor.name.clone());
        }

        copy.subtract(&model_data);
        model_data.subtract(data);

        // feature policy is ignored for host CPUs
        cpu.kind = CpuType::Guest;

        self.extract_features(&mut cpu, FeaturePolicy::Require, &mut copy)?;
        self.extract_features(&mut cpu, FeaturePolicy::Disable, &mut model_data)?;

        Ok(cpu)
    }
}

impl X86Model {
    /// Builds a model from a CPU definition, keeping only features carrying
    /// the requested policy.
    ///
    /// With [`FeaturePolicy::Require`] the named base model contributes its
    /// data; for any other policy the model starts empty. Host-type CPUs
    /// contribute all their features regardless of policy, as policies do
    /// not apply to them.
    pub fn from_cpu(cpu: &CpuDef, map: &X86Map, policy: FeaturePolicy) -> Result<X86Model, Error> {
        let mut model = if policy == FeaturePolicy::Require {
            let name = cpu.model.as_deref().unwrap_or_default();
            map.model(name)
                .cloned()
                .ok_or_else(|| Error::UnknownModel(name.to_string()))?
        } else if cpu.kind == CpuType::Host {
            return Ok(X86Model::default());
        } else {
            X86Model::default()
        };

        for feature in &cpu.features {
            if cpu.kind == CpuType::Guest && feature.policy != Some(policy) {
                continue;
            }
            let found = map
                .feature(&feature.name)
                .ok_or_else(|| Error::UnknownFeature(feature.name.clone()))?;
            model.data.union_with(&found.data);
        }

        Ok(model)
    }

    /// Removes the footprint of `cpu` (its base model plus every listed
    /// feature) from this model's data.
    pub fn subtract_cpu(&mut self, cpu: &CpuDef, map: &X86Map) -> Result<(), Error> {
        let name = cpu.model.as_deref().unwrap_or_default();
        let cpu_model = map
            .model(name)
            .ok_or_else(|| Error::UnknownModel(name.to_string()))?;
        self.data.subtract(&cpu_model.data);

        for feature in &cpu.features {
            let found = map
                .feature(&feature.name)
                .ok_or_else(|| Error::UnknownFeature(feature.name.clone()))?;
            self.data.subtract(&found.data);
        }

        Ok(())
    }
}
