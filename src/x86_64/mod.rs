// Copyright © 2026 The cpu-model Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! CPU driver for CPUs with an x86 compatible CPUID instruction.
//!
//! All operations are stateless between calls: each one loads a fresh
//! catalog from the driver's [`CpuMapSource`] and releases it on return, so
//! observable behavior always reflects the current catalog stream.

pub mod data;
pub mod map;

use thiserror::Error;

pub use self::data::{CpuidLeaf, X86Data, CPUX86_BASIC, CPUX86_EXTENDED};
pub use self::map::{
    CpuMapElement, CpuMapSource, CpuidProps, FeatureProps, ModelProps, VendorProps, X86Feature,
    X86Map, X86Model, X86Vendor,
};
use crate::{CpuArch, CpuCompareResult, CpuDef, CpuFallback, CpuMatch, CpuMode, CpuType,
            FeaturePolicy};

/// Architectures this driver can reason about.
const ARCHS: [CpuArch; 2] = [CpuArch::I686, CpuArch::X86_64];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown CPU model {0}")]
    UnknownModel(String),
    #[error("Unknown CPU feature {0}")]
    UnknownFeature(String),
    #[error("Unknown CPU vendor {0}")]
    UnknownVendor(String),
    #[error("CPU model {0} is not supported by hypervisor")]
    ModelNotSupported(String),
    #[error("Cannot find suitable CPU model for given data")]
    NoSuitableModel,
    #[error("CPU vendor {vendor} of model {model} differs from vendor {cpu_vendor}")]
    VendorMismatch {
        vendor: String,
        model: String,
        cpu_vendor: String,
    },
    #[error("CPU vendors do not match")]
    VendorsDoNotMatch,
    #[error("CPUs are incompatible")]
    CpusIncompatible,
    #[error("No CPUs given to baseline")]
    NoCpus,
    #[error("Invalid CPU definition")]
    CpuDef(#[from] crate::CpuDefError),
}

/// Raw CPUID data tagged with the architecture it was measured for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuData {
    pub arch: Option<CpuArch>,
    pub data: X86Data,
}

/// Which per-policy bit sets [`X86CpuDriver::encode`] should produce.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDataSelection {
    pub force: bool,
    pub require: bool,
    pub optional: bool,
    pub disable: bool,
    pub forbid: bool,
    pub vendor: bool,
}

impl CpuDataSelection {
    pub fn all() -> Self {
        CpuDataSelection {
            force: true,
            require: true,
            optional: true,
            disable: true,
            forbid: true,
            vendor: true,
        }
    }
}

/// Per-policy CPUID bit sets encoded from a CPU definition.
#[derive(Debug, Default)]
pub struct EncodedCpuData {
    pub force: Option<CpuData>,
    pub require: Option<CpuData>,
    pub optional: Option<CpuData>,
    pub disable: Option<CpuData>,
    pub forbid: Option<CpuData>,
    pub vendor: Option<CpuData>,
}

/// Relation between the CPUID data of two models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareResult {
    Subset,
    Equal,
    Superset,
    Unrelated,
}

/// Three-way relation between two models, computed as a symmetric two-pass
/// walk over their leaves.
fn model_compare(model1: &X86Model, model2: &X86Model) -> CompareResult {
    fn fold(result: &mut CompareResult, contribution: CompareResult) -> bool {
        if *result == CompareResult::Equal {
            *result = contribution;
        } else if *result != contribution {
            return false;
        }
        true
    }

    let mut result = CompareResult::Equal;

    for leaf1 in model1.data.iter() {
        let mut contribution = CompareResult::Superset;
        if let Some(leaf2) = model2.data.leaf(leaf1.function) {
            if leaf1.matches(leaf2) {
                continue;
            }
            if !leaf1.matches_masked(leaf2) {
                contribution = CompareResult::Subset;
            }
        }
        if !fold(&mut result, contribution) {
            return CompareResult::Unrelated;
        }
    }

    for leaf2 in model2.data.iter() {
        let mut contribution = CompareResult::Subset;
        if let Some(leaf1) = model1.data.leaf(leaf2.function) {
            if leaf2.matches(leaf1) {
                continue;
            }
            if !leaf2.matches_masked(leaf1) {
                contribution = CompareResult::Superset;
            }
        }
        if !fold(&mut result, contribution) {
            return CompareResult::Unrelated;
        }
    }

    result
}

fn model_is_allowed(name: &str, models: &[String]) -> bool {
    models.is_empty() || models.iter().any(|allowed| allowed == name)
}

fn incompatible(
    map: &X86Map,
    message: &str,
    data: &X86Data,
) -> (CpuCompareResult, Option<CpuData>, Option<String>) {
    let names = map.feature_names(data, ", ");
    debug!("{message}: {names}");
    (
        CpuCompareResult::Incompatible,
        None,
        Some(format!("{message}: {names}")),
    )
}

/// The x86 CPU driver. Holds the catalog source; every operation loads its
/// own catalog and owns all intermediate state.
#[derive(Debug)]
pub struct X86CpuDriver<S> {
    map_source: S,
}

impl<S: CpuMapSource> X86CpuDriver<S> {
    pub fn new(map_source: S) -> Self {
        X86CpuDriver { map_source }
    }

    fn load_map(&self) -> Result<X86Map, Error> {
        X86Map::load(&self.map_source)
    }

    /// Classifies how compatible `cpu` is with the given host CPU.
    pub fn compare(&self, host: &CpuDef, cpu: &CpuDef) -> Result<CpuCompareResult, Error> {
        self.compute(host, cpu, false).map(|(result, _, _)| result)
    }

    /// Like [`compare`](Self::compare), but also synthesizes the CPUID data
    /// the guest may expose and explains incompatibilities in the returned
    /// message.
    pub fn guest_data(
        &self,
        host: &CpuDef,
        guest: &CpuDef,
    ) -> Result<(CpuCompareResult, Option<CpuData>, Option<String>), Error> {
        self.compute(host, guest, true)
    }

    fn compute(
        &self,
        host: &CpuDef,
        cpu: &CpuDef,
        want_guest: bool,
    ) -> Result<(CpuCompareResult, Option<CpuData>, Option<String>), Error> {
        let arch = match cpu.arch {
            Some(arch) if !ARCHS.contains(&arch) => {
                let message = format!("CPU arch {arch} does not match host arch");
                debug!("{message}");
                return Ok((CpuCompareResult::Incompatible, None, Some(message)));
            }
            Some(arch) => Some(arch),
            None => host.arch,
        };

        if let Some(cpu_vendor) = &cpu.vendor {
            if host.vendor.as_deref() != Some(cpu_vendor.as_str()) {
                let message =
                    format!("host CPU vendor does not match required CPU vendor {cpu_vendor}");
                debug!("{message}");
                return Ok((CpuCompareResult::Incompatible, None, Some(message)));
            }
        }

        let map = self.load_map()?;
        let host_model = X86Model::from_cpu(host, &map, FeaturePolicy::Require)?;
        let cpu_force = X86Model::from_cpu(cpu, &map, FeaturePolicy::Force)?;
        let mut cpu_require = X86Model::from_cpu(cpu, &map, FeaturePolicy::Require)?;
        let cpu_optional = X86Model::from_cpu(cpu, &map, FeaturePolicy::Optional)?;
        let cpu_disable = X86Model::from_cpu(cpu, &map, FeaturePolicy::Disable)?;
        let mut cpu_forbid = X86Model::from_cpu(cpu, &map, FeaturePolicy::Forbid)?;

        cpu_forbid.data.intersect_with(&host_model.data);
        if !cpu_forbid.data.is_empty() {
            return Ok(incompatible(
                &map,
                "Host CPU provides forbidden features",
                &cpu_forbid.data,
            ));
        }

        // Features inherited from the base model that were explicitly
        // forced, disabled, or made optional no longer have to be provided
        // by the host.
        cpu_require.data.subtract(&cpu_force.data);
        cpu_require.data.subtract(&cpu_optional.data);
        cpu_require.data.subtract(&cpu_disable.data);

        let result = model_compare(&host_model, &cpu_require);
        if result == CompareResult::Subset || result == CompareResult::Unrelated {
            cpu_require.data.subtract(&host_model.data);
            return Ok(incompatible(
                &map,
                "Host CPU does not provide required features",
                &cpu_require.data,
            ));
        }

        let mut ret = CpuCompareResult::Identical;

        let mut diff = host_model.data.clone();
        diff.subtract(&cpu_optional.data);
        diff.subtract(&cpu_require.data);
        diff.subtract(&cpu_disable.data);
        diff.subtract(&cpu_force.data);
        if !diff.is_empty() {
            ret = CpuCompareResult::Superset;
        }

        if ret == CpuCompareResult::Superset
            && cpu.kind == CpuType::Guest
            && cpu.match_mode == CpuMatch::Strict
        {
            return Ok(incompatible(
                &map,
                "Host CPU does not strictly match guest CPU: Extra features",
                &diff,
            ));
        }

        let guest = want_guest.then(|| {
            let mut guest_data = host_model.data.clone();
            if cpu.kind == CpuType::Guest && cpu.match_mode == CpuMatch::Exact {
                guest_data.subtract(&diff);
            }
            guest_data.union_with(&cpu_force.data);
            guest_data.subtract(&cpu_disable.data);
            CpuData {
                arch,
                data: guest_data,
            }
        });

        Ok((ret, guest, None))
    }

    /// Finds the closest named model for `data` and rewrites `cpu` with the
    /// resulting model, vendor, and residual features.
    ///
    /// `models` is the hypervisor's allow-list (empty allows everything),
    /// `preferred` short-circuits the search when it matches, and
    /// `expand_features` renders the chosen model's own features as an
    /// explicit REQUIRE list.
    pub fn decode(
        &self,
        cpu: &mut CpuDef,
        data: &CpuData,
        models: &[String],
        preferred: Option<&str>,
        expand_features: bool,
    ) -> Result<(), Error> {
        self.decode_data(cpu, &data.data, models, preferred, expand_features)
    }

    fn decode_data(
        &self,
        cpu: &mut CpuDef,
        data: &X86Data,
        models: &[String],
        preferred: Option<&str>,
        expand_features: bool,
    ) -> Result<(), Error> {
        let map = self.load_map()?;
        let mut best: Option<(CpuDef, &X86Data)> = None;

        'candidates: for candidate in map.models() {
            if !model_is_allowed(&candidate.name, models) {
                if preferred == Some(candidate.name.as_str()) {
                    if cpu.fallback != CpuFallback::Allow {
                        return Err(Error::ModelNotSupported(candidate.name.clone()));
                    }
                    warn!(
                        "Preferred CPU model {} not allowed by hypervisor; closest supported \
                         model will be used",
                        candidate.name
                    );
                } else {
                    debug!("CPU model {} not allowed by hypervisor; ignoring", candidate.name);
                }
                continue;
            }

            let mut cpu_candidate = map.cpu_from_data(data, candidate)?;

            if let (Some(candidate_vendor), Some(data_vendor)) =
                (&candidate.vendor, &cpu_candidate.vendor)
            {
                if candidate_vendor != data_vendor {
                    debug!(
                        "CPU vendor {candidate_vendor} of model {} differs from {data_vendor}; \
                         ignoring",
                        candidate.name
                    );
                    continue;
                }
            }

            if cpu.kind == CpuType::Host {
                cpu_candidate.kind = CpuType::Host;
                for feature in &mut cpu_candidate.features {
                    // A model whose features the data does not cover cannot
                    // describe a host.
                    if feature.policy == Some(FeaturePolicy::Disable) {
                        continue 'candidates;
                    }
                    feature.policy = None;
                }
            }

            if preferred.is_some() && preferred == cpu_candidate.model.as_deref() {
                best = Some((cpu_candidate, &candidate.data));
                break;
            }

            if best
                .as_ref()
                .map_or(true, |(model, _)| model.features.len() > cpu_candidate.features.len())
            {
                best = Some((cpu_candidate, &candidate.data));
            }
        }

        let Some((mut cpu_model, model_data)) = best else {
            return Err(Error::NoSuitableModel);
        };

        if expand_features {
            let mut copy = model_data.clone();
            let features = map.data_from_cpu_features(&cpu_model)?;
            copy.subtract(&features);
            map.extract_features(&mut cpu_model, FeaturePolicy::Require, &mut copy)?;
        }

        cpu.model = cpu_model.model.take();
        cpu.vendor = cpu_model.vendor.take();
        cpu.features = std::mem::take(&mut cpu_model.features);

        Ok(())
    }

    /// Produces one CPUID bit set per requested feature policy, plus the
    /// single-leaf vendor identification when asked for. Fails as a whole if
    /// any requested output cannot be built.
    pub fn encode(
        &self,
        arch: Option<CpuArch>,
        cpu: &CpuDef,
        selection: CpuDataSelection,
    ) -> Result<EncodedCpuData, Error> {
        let map = self.load_map()?;
        let encode_policy = |policy| -> Result<Option<CpuData>, Error> {
            let model = X86Model::from_cpu(cpu, &map, policy)?;
            Ok(Some(CpuData {
                arch,
                data: model.data,
            }))
        };

        let mut encoded = EncodedCpuData::default();
        if selection.force {
            encoded.force = encode_policy(FeaturePolicy::Force)?;
        }
        if selection.require {
            encoded.require = encode_policy(FeaturePolicy::Require)?;
        }
        if selection.optional {
            encoded.optional = encode_policy(FeaturePolicy::Optional)?;
        }
        if selection.disable {
            encoded.disable = encode_policy(FeaturePolicy::Disable)?;
        }
        if selection.forbid {
            encoded.forbid = encode_policy(FeaturePolicy::Forbid)?;
        }
        if selection.vendor {
            if let Some(name) = &cpu.vendor {
                let vendor = map
                    .vendor(name)
                    .ok_or_else(|| Error::UnknownVendor(name.clone()))?;
                let mut data = X86Data::new();
                data.add_leaf(&vendor.cpuid);
                encoded.vendor = Some(CpuData { arch, data });
            }
        }

        Ok(encoded)
    }

    /// Computes a CPU definition that runs on every one of the given host
    /// CPUs: the intersection of their capabilities, named after the closest
    /// catalog model.
    pub fn baseline(
        &self,
        cpus: &[CpuDef],
        models: &[String],
        expand_features: bool,
    ) -> Result<CpuDef, Error> {
        let map = self.load_map()?;
        let Some(first) = cpus.first() else {
            return Err(Error::NoCpus);
        };

        let mut base_model = X86Model::from_cpu(first, &map, FeaturePolicy::Require)?;
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            match_mode: CpuMatch::Exact,
            arch: first.arch,
            ..Default::default()
        };

        let mut output_vendor = true;
        let mut vendor = match &first.vendor {
            Some(name) => Some(
                map.vendor(name)
                    .ok_or_else(|| Error::UnknownVendor(name.clone()))?,
            ),
            None => {
                output_vendor = false;
                None
            }
        };

        for other in &cpus[1..] {
            let model = X86Model::from_cpu(other, &map, FeaturePolicy::Require)?;

            if let (Some(cpu_vendor), Some(model_vendor)) = (&other.vendor, &model.vendor) {
                if cpu_vendor != model_vendor {
                    return Err(Error::VendorMismatch {
                        vendor: model_vendor.clone(),
                        model: model.name.clone(),
                        cpu_vendor: cpu_vendor.clone(),
                    });
                }
            }

            let vendor_name = if other.vendor.is_some() {
                other.vendor.clone()
            } else {
                output_vendor = false;
                model.vendor.clone()
            };

            if let Some(vendor_name) = vendor_name {
                match vendor {
                    None => {
                        vendor = Some(
                            map.vendor(&vendor_name)
                                .ok_or_else(|| Error::UnknownVendor(vendor_name.clone()))?,
                        );
                    }
                    Some(known) if known.name != vendor_name => {
                        return Err(Error::VendorsDoNotMatch);
                    }
                    Some(_) => {}
                }
            }

            base_model.data.intersect_with(&model.data);
        }

        if base_model.data.is_empty() {
            return Err(Error::CpusIncompatible);
        }

        if let Some(vendor) = vendor {
            base_model.data.add_leaf(&vendor.cpuid);
        }

        self.decode_data(&mut cpu, &base_model.data, models, None, expand_features)?;

        if !output_vendor {
            cpu.vendor = None;
        }
        cpu.arch = None;

        Ok(cpu)
    }

    /// Rewrites `guest` against the given host according to the guest's
    /// configuration mode.
    pub fn update(&self, guest: &mut CpuDef, host: &CpuDef) -> Result<(), Error> {
        match guest.mode {
            CpuMode::Custom => self.update_custom(guest, host),
            CpuMode::HostModel => self.update_host_model(guest, host),
            CpuMode::HostPassthrough => {
                guest.match_mode = CpuMatch::Minimum;
                guest.clear_model();
                guest.copy_model_from(host, true);
                Ok(())
            }
        }
    }

    fn update_custom(&self, guest: &mut CpuDef, host: &CpuDef) -> Result<(), Error> {
        let map = self.load_map()?;
        let mut host_model = X86Model::from_cpu(host, &map, FeaturePolicy::Require)?;

        for feature in &mut guest.features {
            if feature.policy == Some(FeaturePolicy::Optional) {
                let found = map
                    .feature(&feature.name)
                    .ok_or_else(|| Error::UnknownFeature(feature.name.clone()))?;
                feature.policy = Some(if host_model.data.covers(&found.data) {
                    FeaturePolicy::Require
                } else {
                    FeaturePolicy::Disable
                });
            }
        }

        if guest.match_mode == CpuMatch::Minimum {
            guest.match_mode = CpuMatch::Exact;
            host_model.subtract_cpu(guest, &map)?;
            let mut remaining = host_model.data;
            map.extract_features(guest, FeaturePolicy::Require, &mut remaining)?;
        }

        Ok(())
    }

    fn update_host_model(&self, guest: &mut CpuDef, host: &CpuDef) -> Result<(), Error> {
        guest.match_mode = CpuMatch::Exact;

        // no updates are required
        if guest.features.is_empty() {
            guest.clear_model();
            guest.copy_model_from(host, true);
            return Ok(());
        }

        // update the host model according to the desired configuration
        let configured = guest.features.clone();
        guest.clear_model();
        guest.copy_model_from(host, true);
        for feature in &configured {
            guest.update_feature(&feature.name, feature.policy);
        }

        Ok(())
    }

    /// Whether the named catalog feature is fully present in `data`.
    pub fn has_feature(&self, data: &CpuData, name: &str) -> Result<bool, Error> {
        let map = self.load_map()?;
        let feature = map
            .feature(name)
            .ok_or_else(|| Error::UnknownFeature(name.to_string()))?;
        Ok(data.data.covers(&feature.data))
    }

    /// Measures the CPUID data of the CPU this code is running on: every
    /// basic and extended leaf up to the maximum the hardware reports.
    #[cfg(target_arch = "x86_64")]
    pub fn node_data(&self, arch: Option<CpuArch>) -> Result<CpuData, Error> {
        let basic = cpuid_set(CPUX86_BASIC);
        let extended = cpuid_set(CPUX86_EXTENDED);

        let mut data = X86Data::new();
        for leaf in basic.iter().chain(extended.iter()) {
            data.add_leaf(leaf);
        }

        Ok(CpuData { arch, data })
    }
}

#[cfg(target_arch = "x86_64")]
fn cpuid_set(base: u32) -> Vec<CpuidLeaf> {
    let leaf = unsafe { std::arch::x86_64::__cpuid_count(base, 0) };
    let max = leaf.eax.saturating_sub(base);

    let mut set = Vec::with_capacity(max as usize + 1);
    for i in 0..=max {
        // Some leaves take the other registers as additional arguments;
        // __cpuid_count zeroes ecx for every call.
        let registers = unsafe { std::arch::x86_64::__cpuid_count(base | i, 0) };
        set.push(CpuidLeaf {
            function: base | i,
            eax: registers.eax,
            ebx: registers.ebx,
            ecx: registers.ecx,
            edx: registers.edx,
        });
    }

    set
}

#[cfg(test)]
mod tests {
    use super::map::{FeatureProps, ModelProps, VendorProps};
    use super::*;

    fn vendor(name: &str, string: &str) -> CpuMapElement {
        CpuMapElement::Vendor(VendorProps {
            name: Some(name.to_string()),
            string: Some(string.to_string()),
        })
    }

    fn feature(name: &str, function: &str, ecx: Option<&str>, edx: Option<&str>) -> CpuMapElement {
        CpuMapElement::Feature(FeatureProps {
            name: Some(name.to_string()),
            cpuid: vec![CpuidProps {
                function: Some(function.to_string()),
                ecx: ecx.map(str::to_string),
                edx: edx.map(str::to_string),
                ..Default::default()
            }],
        })
    }

    fn model(
        name: &str,
        ancestor: Option<&str>,
        vendor: Option<&str>,
        features: &[&str],
    ) -> CpuMapElement {
        CpuMapElement::Model(ModelProps {
            name: Some(name.to_string()),
            model: ancestor.map(str::to_string),
            vendor: vendor.map(str::to_string),
            features: features.iter().map(|f| f.to_string()).collect(),
        })
    }

    fn catalog() -> Vec<CpuMapElement> {
        vec![
            vendor("Intel", "GenuineIntel"),
            vendor("AMD", "AuthenticAMD"),
            feature("lm", "0x80000001", None, Some("0x20000000")),
            feature("sse4.2", "0x1", Some("0x00100000"), None),
            feature("avx", "0x1", Some("0x10000000"), None),
            feature("aes", "0x1", Some("0x02000000"), None),
            feature("svm", "0x80000001", Some("0x00000004"), None),
            model("Core2", None, Some("Intel"), &["lm"]),
            model("Nehalem", Some("Core2"), None, &["sse4.2"]),
            model("Opteron", None, Some("AMD"), &["lm", "svm"]),
            model("Solo1", None, None, &["sse4.2"]),
            model("Solo2", None, None, &["avx"]),
        ]
    }

    fn driver() -> X86CpuDriver<Vec<CpuMapElement>> {
        X86CpuDriver::new(catalog())
    }

    fn test_map() -> X86Map {
        X86Map::load(&catalog()).unwrap()
    }

    fn host_cpu(model: &str, features: &[&str]) -> CpuDef {
        let mut cpu = CpuDef {
            kind: CpuType::Host,
            arch: Some(CpuArch::X86_64),
            model: Some(model.to_string()),
            ..Default::default()
        };
        for name in features {
            cpu.add_feature(name, None).unwrap();
        }
        cpu
    }

    fn guest_cpu(model: &str, match_mode: CpuMatch, features: &[(&str, FeaturePolicy)]) -> CpuDef {
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            match_mode,
            model: Some(model.to_string()),
            ..Default::default()
        };
        for (name, policy) in features {
            cpu.add_feature(name, Some(*policy)).unwrap();
        }
        cpu
    }

    #[test]
    fn compare_model_with_itself_is_equal() {
        let map = test_map();
        for m in map.models() {
            assert_eq!(model_compare(m, m), CompareResult::Equal, "{}", m.name);
        }
    }

    #[test]
    fn compare_polarity_is_symmetric() {
        let map = test_map();
        let core2 = map.model("Core2").unwrap();
        let nehalem = map.model("Nehalem").unwrap();
        let solo2 = map.model("Solo2").unwrap();

        assert_eq!(model_compare(nehalem, core2), CompareResult::Superset);
        assert_eq!(model_compare(core2, nehalem), CompareResult::Subset);
        assert_eq!(model_compare(core2, solo2), CompareResult::Unrelated);
        assert_eq!(model_compare(solo2, core2), CompareResult::Unrelated);
    }

    #[test]
    fn identical_guest_matches_host() {
        // S1: host and guest both define Nehalem.
        let host = host_cpu("Nehalem", &[]);
        let guest = guest_cpu("Nehalem", CpuMatch::Exact, &[]);

        let (result, data, message) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Identical);
        assert!(message.is_none());

        let map = test_map();
        assert_eq!(data.unwrap().data, map.model("Nehalem").unwrap().data);
    }

    #[test]
    fn missing_required_feature_is_incompatible() {
        // S2: the host lacks the sse4.2 part of Nehalem.
        let host = host_cpu("Core2", &[]);
        let guest = guest_cpu("Nehalem", CpuMatch::Exact, &[]);

        let (result, data, message) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Incompatible);
        assert!(data.is_none());
        assert_eq!(
            message.as_deref(),
            Some("Host CPU does not provide required features: sse4.2")
        );
    }

    #[test]
    fn host_extras_fail_strict_matching() {
        // S3, strict half.
        let host = host_cpu("Nehalem", &["avx"]);
        let guest = guest_cpu("Nehalem", CpuMatch::Strict, &[]);

        let (result, _, message) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Incompatible);
        assert_eq!(
            message.as_deref(),
            Some("Host CPU does not strictly match guest CPU: Extra features: avx")
        );
    }

    #[test]
    fn host_extras_are_hidden_under_exact_matching() {
        // S3, exact half: the guest sees Nehalem without the host's avx.
        let host = host_cpu("Nehalem", &["avx"]);
        let guest = guest_cpu("Nehalem", CpuMatch::Exact, &[]);

        let (result, data, _) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Superset);
        assert_eq!(data.unwrap().data, test_map().model("Nehalem").unwrap().data);
    }

    #[test]
    fn forbidden_feature_on_host_is_incompatible() {
        // S5 / property 9.
        let host = host_cpu("Nehalem", &["svm"]);
        let guest = guest_cpu("Nehalem", CpuMatch::Exact, &[("svm", FeaturePolicy::Forbid)]);

        let (result, _, message) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Incompatible);
        assert_eq!(
            message.as_deref(),
            Some("Host CPU provides forbidden features: svm")
        );
    }

    #[test]
    fn forced_and_disabled_features_shape_guest_data() {
        let host = host_cpu("Nehalem", &["avx"]);
        let guest = guest_cpu(
            "Nehalem",
            CpuMatch::Exact,
            &[
                ("avx", FeaturePolicy::Force),
                ("sse4.2", FeaturePolicy::Disable),
            ],
        );

        let (result, data, _) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Identical);

        let map = test_map();
        let data = data.unwrap().data;
        assert!(data.covers(&map.feature("lm").unwrap().data));
        assert!(data.covers(&map.feature("avx").unwrap().data));
        assert!(!data.covers(&map.feature("sse4.2").unwrap().data));
    }

    #[test]
    fn unsupported_arch_is_incompatible() {
        let host = host_cpu("Nehalem", &[]);
        let mut guest = guest_cpu("Nehalem", CpuMatch::Exact, &[]);
        guest.arch = Some(CpuArch::Aarch64);

        let (result, _, message) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Incompatible);
        assert_eq!(
            message.as_deref(),
            Some("CPU arch aarch64 does not match host arch")
        );
    }

    #[test]
    fn vendor_mismatch_is_incompatible() {
        let host = host_cpu("Nehalem", &[]);
        let mut guest = guest_cpu("Nehalem", CpuMatch::Exact, &[]);
        guest.vendor = Some("Intel".to_string());

        let (result, _, message) = driver().guest_data(&host, &guest).unwrap();
        assert_eq!(result, CpuCompareResult::Incompatible);
        assert_eq!(
            message.as_deref(),
            Some("host CPU vendor does not match required CPU vendor Intel")
        );
    }

    #[test]
    fn decode_round_trips_every_model() {
        // Property 4: a model's own data decodes back to the model with no
        // residual features.
        let map = test_map();
        for m in map.models() {
            let mut cpu = CpuDef {
                kind: CpuType::Guest,
                ..Default::default()
            };
            let data = CpuData {
                arch: None,
                data: m.data.clone(),
            };
            driver().decode(&mut cpu, &data, &[], None, false).unwrap();
            assert_eq!(cpu.model.as_deref(), Some(m.name.as_str()), "{}", m.name);
            assert!(cpu.features.is_empty(), "{}", m.name);
        }
    }

    #[test]
    fn decode_prefers_first_candidate_on_equal_residuals() {
        // Two models with identical data: the earlier one wins.
        let mut elements = catalog();
        elements.push(model("Twin1", None, None, &["aes"]));
        elements.push(model("Twin2", None, None, &["aes"]));
        let driver = X86CpuDriver::new(elements);

        let map = test_map();
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            ..Default::default()
        };
        let data = CpuData {
            arch: None,
            data: map.feature("aes").unwrap().data.clone(),
        };
        driver.decode(&mut cpu, &data, &[], None, false).unwrap();
        assert_eq!(cpu.model.as_deref(), Some("Twin1"));
    }

    #[test]
    fn decode_honors_preferred_model() {
        let map = test_map();
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            ..Default::default()
        };
        let data = CpuData {
            arch: None,
            data: map.model("Nehalem").unwrap().data.clone(),
        };
        driver()
            .decode(&mut cpu, &data, &[], Some("Core2"), false)
            .unwrap();
        assert_eq!(cpu.model.as_deref(), Some("Core2"));
        assert_eq!(cpu.features.len(), 1);
        assert_eq!(cpu.features[0].name, "sse4.2");
        assert_eq!(cpu.features[0].policy, Some(FeaturePolicy::Require));
    }

    #[test]
    fn decode_rejects_disallowed_preferred_model_without_fallback() {
        let map = test_map();
        let data = CpuData {
            arch: None,
            data: map.model("Nehalem").unwrap().data.clone(),
        };
        let allowed = vec!["Nehalem".to_string()];

        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            fallback: CpuFallback::Forbid,
            ..Default::default()
        };
        let err = driver()
            .decode(&mut cpu, &data, &allowed, Some("Core2"), false)
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotSupported(name) if name == "Core2"));

        // With fallback allowed the closest permitted model is used instead.
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            ..Default::default()
        };
        driver()
            .decode(&mut cpu, &data, &allowed, Some("Core2"), false)
            .unwrap();
        assert_eq!(cpu.model.as_deref(), Some("Nehalem"));
    }

    #[test]
    fn decode_expands_model_features_on_request() {
        let map = test_map();
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            ..Default::default()
        };
        let data = CpuData {
            arch: None,
            data: map.model("Nehalem").unwrap().data.clone(),
        };
        driver().decode(&mut cpu, &data, &[], None, true).unwrap();

        assert_eq!(cpu.model.as_deref(), Some("Nehalem"));
        let features: Vec<&str> = cpu.features.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(features, vec!["lm", "sse4.2"]);
        assert!(cpu
            .features
            .iter()
            .all(|f| f.policy == Some(FeaturePolicy::Require)));
    }

    #[test]
    fn decode_for_host_cpu_erases_policies() {
        let map = test_map();
        let mut host_data = map.model("Nehalem").unwrap().data.clone();
        host_data.union_with(&map.feature("avx").unwrap().data);

        let mut cpu = CpuDef::default();
        let data = CpuData {
            arch: None,
            data: host_data,
        };
        driver().decode(&mut cpu, &data, &[], None, false).unwrap();

        assert_eq!(cpu.model.as_deref(), Some("Nehalem"));
        assert_eq!(cpu.features.len(), 1);
        assert_eq!(cpu.features[0].name, "avx");
        assert_eq!(cpu.features[0].policy, None);
    }

    #[test]
    fn decode_fails_without_any_candidate() {
        let mut cpu = CpuDef {
            kind: CpuType::Guest,
            ..Default::default()
        };
        let data = CpuData {
            arch: None,
            data: X86Data::new(),
        };
        let allowed = vec!["NoSuchModel".to_string()];
        let err = driver().decode(&mut cpu, &data, &allowed, None, false).unwrap_err();
        assert!(matches!(err, Error::NoSuitableModel));
    }

    #[test]
    fn encode_produces_per_policy_data() {
        let mut cpu = guest_cpu(
            "Nehalem",
            CpuMatch::Exact,
            &[
                ("avx", FeaturePolicy::Force),
                ("aes", FeaturePolicy::Disable),
            ],
        );
        cpu.vendor = Some("Intel".to_string());

        let map = test_map();
        let encoded = driver()
            .encode(Some(CpuArch::X86_64), &cpu, CpuDataSelection::all())
            .unwrap();

        let require = encoded.require.unwrap();
        assert_eq!(require.arch, Some(CpuArch::X86_64));
        assert_eq!(require.data, map.model("Nehalem").unwrap().data);

        assert_eq!(encoded.force.unwrap().data, map.feature("avx").unwrap().data);
        assert_eq!(encoded.disable.unwrap().data, map.feature("aes").unwrap().data);
        assert!(encoded.optional.unwrap().data.is_empty());
        assert!(encoded.forbid.unwrap().data.is_empty());

        let vendor = encoded.vendor.unwrap();
        assert_eq!(vendor.data.iter().count(), 1);
        assert_eq!(
            vendor.data.leaf(0),
            Some(&map.vendor("Intel").unwrap().cpuid)
        );
    }

    #[test]
    fn encode_fails_on_unknown_vendor() {
        let mut cpu = guest_cpu("Nehalem", CpuMatch::Exact, &[]);
        cpu.vendor = Some("NoSuchVendor".to_string());
        let selection = CpuDataSelection {
            vendor: true,
            ..Default::default()
        };
        let err = driver().encode(None, &cpu, selection).unwrap_err();
        assert!(matches!(err, Error::UnknownVendor(_)));
    }

    #[test]
    fn baseline_intersects_two_hosts() {
        // S6: both hosts are Nehalem-class Intel machines with different
        // extra features.
        let mut host_a = host_cpu("Nehalem", &["avx"]);
        host_a.vendor = Some("Intel".to_string());
        let mut host_b = host_cpu("Nehalem", &["aes"]);
        host_b.vendor = Some("Intel".to_string());

        let cpu = driver().baseline(&[host_a, host_b], &[], false).unwrap();

        assert_eq!(cpu.model.as_deref(), Some("Nehalem"));
        assert_eq!(cpu.vendor.as_deref(), Some("Intel"));
        assert_eq!(cpu.kind, CpuType::Guest);
        assert_eq!(cpu.match_mode, CpuMatch::Exact);
        assert!(cpu.arch.is_none());
        assert!(cpu.features.is_empty());
    }

    #[test]
    fn baseline_is_commutative() {
        // Property 7.
        let host_a = host_cpu("Nehalem", &["avx"]);
        let host_b = host_cpu("Core2", &["aes"]);

        let ab = driver()
            .baseline(&[host_a.clone(), host_b.clone()], &[], false)
            .unwrap();
        let ba = driver().baseline(&[host_b, host_a], &[], false).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.model.as_deref(), Some("Core2"));
    }

    #[test]
    fn baseline_of_disjoint_cpus_fails() {
        // Property 8.
        let host_a = host_cpu("Solo1", &[]);
        let host_b = host_cpu("Solo2", &[]);
        let err = driver().baseline(&[host_a, host_b], &[], false).unwrap_err();
        assert!(matches!(err, Error::CpusIncompatible));
    }

    #[test]
    fn baseline_suppresses_vendor_when_an_input_lacks_one() {
        let mut host_a = host_cpu("Nehalem", &[]);
        host_a.vendor = Some("Intel".to_string());
        let host_b = host_cpu("Nehalem", &[]);

        let cpu = driver().baseline(&[host_a, host_b], &[], false).unwrap();
        assert!(cpu.vendor.is_none());
    }

    #[test]
    fn baseline_rejects_vendor_disagreement() {
        let mut host_a = host_cpu("Nehalem", &[]);
        host_a.vendor = Some("Intel".to_string());
        let mut host_b = host_cpu("Solo1", &[]);
        host_b.vendor = Some("AMD".to_string());

        let err = driver().baseline(&[host_a, host_b], &[], false).unwrap_err();
        assert!(matches!(err, Error::VendorsDoNotMatch));
    }

    #[test]
    fn baseline_rejects_cpu_vendor_differing_from_model_vendor() {
        let host_a = host_cpu("Solo1", &[]);
        let mut host_b = host_cpu("Opteron", &[]);
        host_b.vendor = Some("Intel".to_string());

        let err = driver().baseline(&[host_a, host_b], &[], false).unwrap_err();
        assert!(matches!(err, Error::VendorMismatch { .. }));
    }

    #[test]
    fn update_host_passthrough_copies_the_host_model() {
        // S4.
        let mut host = host_cpu("Nehalem", &[]);
        host.vendor = Some("Intel".to_string());
        let mut guest = CpuDef {
            kind: CpuType::Guest,
            mode: CpuMode::HostPassthrough,
            ..Default::default()
        };

        driver().update(&mut guest, &host).unwrap();
        assert_eq!(guest.model.as_deref(), Some("Nehalem"));
        assert_eq!(guest.vendor.as_deref(), Some("Intel"));
        assert_eq!(guest.match_mode, CpuMatch::Minimum);
    }

    #[test]
    fn update_custom_promotes_optional_features() {
        let host = host_cpu("Nehalem", &["avx"]);
        let mut guest = guest_cpu(
            "Nehalem",
            CpuMatch::Exact,
            &[
                ("avx", FeaturePolicy::Optional),
                ("aes", FeaturePolicy::Optional),
            ],
        );

        driver().update(&mut guest, &host).unwrap();
        assert_eq!(guest.features[0].policy, Some(FeaturePolicy::Require));
        assert_eq!(guest.features[1].policy, Some(FeaturePolicy::Disable));
    }

    #[test]
    fn update_custom_expands_minimum_match() {
        let host = host_cpu("Nehalem", &[]);
        let mut guest = guest_cpu("Core2", CpuMatch::Minimum, &[]);

        driver().update(&mut guest, &host).unwrap();
        assert_eq!(guest.match_mode, CpuMatch::Exact);
        assert_eq!(guest.features.len(), 1);
        assert_eq!(guest.features[0].name, "sse4.2");
        assert_eq!(guest.features[0].policy, Some(FeaturePolicy::Require));
    }

    #[test]
    fn update_host_model_reapplies_configured_features() {
        let mut host = host_cpu("Nehalem", &[]);
        host.vendor = Some("Intel".to_string());
        let mut guest = CpuDef {
            kind: CpuType::Guest,
            mode: CpuMode::HostModel,
            match_mode: CpuMatch::Minimum,
            ..Default::default()
        };
        guest
            .add_feature("avx", Some(FeaturePolicy::Disable))
            .unwrap();

        driver().update(&mut guest, &host).unwrap();
        assert_eq!(guest.match_mode, CpuMatch::Exact);
        assert_eq!(guest.model.as_deref(), Some("Nehalem"));
        assert_eq!(guest.vendor.as_deref(), Some("Intel"));
        let avx = guest.features.iter().find(|f| f.name == "avx").unwrap();
        assert_eq!(avx.policy, Some(FeaturePolicy::Disable));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn node_data_measures_the_running_cpu() {
        // Leaf 0 always carries at least the vendor identification.
        let data = driver().node_data(Some(CpuArch::X86_64)).unwrap();
        assert_eq!(data.arch, Some(CpuArch::X86_64));
        assert!(!data.data.is_empty());
        assert!(data.data.leaf(0).is_some());
    }

    #[test]
    fn has_feature_checks_catalog_bits() {
        let map = test_map();
        let data = CpuData {
            arch: None,
            data: map.model("Nehalem").unwrap().data.clone(),
        };

        assert!(driver().has_feature(&data, "lm").unwrap());
        assert!(!driver().has_feature(&data, "avx").unwrap());
        assert!(matches!(
            driver().has_feature(&data, "no-such-feature"),
            Err(Error::UnknownFeature(_))
        ));
    }
}
