// Copyright © 2026 The cpu-model Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! CPU model and feature compatibility engine.
//!
//! This crate reasons, purely in terms of data, about what a guest vCPU can
//! and cannot expose given a host CPU and a catalog of known CPU models and
//! features. It compares guest requests against host capabilities, decodes
//! raw CPUID data into the closest named model, encodes per-policy CPUID bit
//! sets, computes a common-denominator CPU over several hosts, and rewrites
//! guest definitions according to their configuration mode.
//!
//! The catalog itself (vendors, features, models) is supplied by the caller
//! through the [`x86_64::CpuMapSource`] visitor; parsing the on-disk catalog
//! format and invoking the CPUID instruction on other hosts stay outside the
//! crate boundary.

#[macro_use]
extern crate log;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod x86_64;

/// Type for returning error code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Platform specific error (x86_64)")]
    PlatformSpecific(#[from] x86_64::Error),
    #[error("Invalid CPU definition")]
    CpuDef(#[from] CpuDefError),
}

/// Type for returning public functions outcome.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while mutating a [`CpuDef`] through its narrow contract.
#[derive(Debug, Error)]
pub enum CpuDefError {
    #[error("CPU feature {0} already defined")]
    FeatureAlreadyDefined(String),
}

/// Guest architectures a CPU definition may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuArch {
    I686,
    X86_64,
    Aarch64,
    Riscv64,
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CpuArch::I686 => "i686",
            CpuArch::X86_64 => "x86_64",
            CpuArch::Aarch64 => "aarch64",
            CpuArch::Riscv64 => "riscv64",
        };
        write!(f, "{name}")
    }
}

/// Whether a definition describes a host CPU or a guest CPU.
///
/// Feature policies only apply to guest CPUs; a host CPU definition simply
/// lists what the host has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuType {
    #[default]
    Host,
    Guest,
}

/// How a guest CPU model is derived from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMode {
    #[default]
    Custom,
    HostModel,
    HostPassthrough,
}

/// How strictly a guest CPU must match the host it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMatch {
    #[default]
    Minimum,
    Exact,
    Strict,
}

/// Whether falling back to the closest supported model is acceptable when
/// the configured model is rejected by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuFallback {
    #[default]
    Allow,
    Forbid,
}

/// Per-feature classification on a guest CPU definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeaturePolicy {
    Force,
    Require,
    Optional,
    Disable,
    Forbid,
}

/// A named feature on a CPU definition.
///
/// `policy` is `None` on host-type CPUs, where per-feature policies are not
/// applicable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuFeatureDef {
    pub name: String,
    pub policy: Option<FeaturePolicy>,
}

/// The generic CPU definition record shared with the rest of the management
/// layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDef {
    pub kind: CpuType,
    pub mode: CpuMode,
    #[serde(rename = "match")]
    pub match_mode: CpuMatch,
    pub fallback: CpuFallback,
    pub arch: Option<CpuArch>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub features: Vec<CpuFeatureDef>,
}

impl CpuDef {
    /// Appends a feature; a feature may appear at most once per definition.
    pub fn add_feature(
        &mut self,
        name: &str,
        policy: Option<FeaturePolicy>,
    ) -> std::result::Result<(), CpuDefError> {
        if self.features.iter().any(|f| f.name == name) {
            return Err(CpuDefError::FeatureAlreadyDefined(name.to_string()));
        }
        self.features.push(CpuFeatureDef {
            name: name.to_string(),
            policy,
        });
        Ok(())
    }

    /// Replaces the policy of an existing feature, or appends the feature if
    /// it is not listed yet.
    pub fn update_feature(&mut self, name: &str, policy: Option<FeaturePolicy>) {
        if let Some(feature) = self.features.iter_mut().find(|f| f.name == name) {
            feature.policy = policy;
        } else {
            self.features.push(CpuFeatureDef {
                name: name.to_string(),
                policy,
            });
        }
    }

    /// Replaces model, vendor, and features with `other`'s.
    ///
    /// With `reset_policy`, features carrying the host-type `None` policy
    /// become [`FeaturePolicy::Require`], turning a host description into a
    /// guest requirement list.
    pub fn copy_model_from(&mut self, other: &CpuDef, reset_policy: bool) {
        self.model = other.model.clone();
        self.vendor = other.vendor.clone();
        self.features = other.features.clone();
        if reset_policy {
            for feature in &mut self.features {
                if feature.policy.is_none() {
                    feature.policy = Some(FeaturePolicy::Require);
                }
            }
        }
    }

    /// Drops model, vendor, and all features.
    pub fn clear_model(&mut self) {
        self.model = None;
        self.vendor = None;
        self.features.clear();
    }
}

/// Outcome of comparing a CPU definition against a host CPU.
///
/// Incompatibility is a normal outcome, not an error; the human-readable
/// explanation travels on a separate message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuCompareResult {
    Incompatible,
    Identical,
    Superset,
}
