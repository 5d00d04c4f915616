//! Compilation options, read programmatically or from the environment.

use std::{env, fmt, str::FromStr};

use crate::{
    device::nvptx::{NAMED_BARRIER_COUNT, TARGET_TRIPLE},
    error::{ErrorKind, Result, ResultExt},
    schedule::{parse_barrier_rules, DeviceCapabilities},
};

const TARGET_ENV: &str = "OMP_NVPTX_TARGET";
const DEVICE_ID_ENV: &str = "OMP_NVPTX_DEVICE_ID";
const BARRIER_ID_ENV: &str = "OMP_NVPTX_BARRIER_ID";
const FORCE_BARRIER_ENV: &str = "OMP_NVPTX_FORCE_BARRIER";

/// The device a module is compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OffloadTarget {
    /// `nvptx64-nvidia-cuda` with the master/worker protocol.
    Nvptx64,
    /// Host fallback through the fork/join runtime.
    Host,
}

impl OffloadTarget {
    /// The target triple written into compiled modules.
    #[must_use]
    pub const fn triple(self) -> &'static str {
        match self {
            Self::Nvptx64 => TARGET_TRIPLE,
            Self::Host => "x86_64-unknown-linux-gnu",
        }
    }
}

impl fmt::Display for OffloadTarget {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match self {
            Self::Nvptx64 => "nvptx64",
            Self::Host => "host",
        })
    }
}

impl FromStr for OffloadTarget {
    type Err = crate::error::Error;

    fn from_str(target: &str) -> Result<Self> {
        match target {
            "nvptx64" | TARGET_TRIPLE => Ok(Self::Nvptx64),
            "host" => Ok(Self::Host),
            other => Err(ErrorKind::InvalidConfig {
                key: String::from(TARGET_ENV),
                value: other.to_owned(),
                reason: String::from("is neither 'nvptx64' nor 'host'"),
            }
            .into()),
        }
    }
}

/// Options of one compilation.
///
/// # Usage
/// ```
/// use omp_nvptx::config::{CodegenOptions, OffloadTarget};
///
/// let options = CodegenOptions::new(OffloadTarget::Nvptx64)
///     .set_device_id(0x10)
///     .set_parallel_barrier_id(2)
///     .unwrap();
/// assert_eq!(options.parallel_barrier_id(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodegenOptions {
    target: OffloadTarget,
    device_id: u32,
    parallel_barrier_id: u32,
    capabilities: DeviceCapabilities,
}

impl CodegenOptions {
    /// Options for `target` with its default device capabilities.
    #[must_use]
    pub fn new(target: OffloadTarget) -> Self {
        Self {
            target,
            device_id: 0,
            parallel_barrier_id: 1,
            capabilities: match target {
                OffloadTarget::Nvptx64 => DeviceCapabilities::nvptx(),
                OffloadTarget::Host => DeviceCapabilities::host(),
            },
        }
    }

    /// Reads the `OMP_NVPTX_*` environment variables, starting from the
    /// defaults of the `nvptx64` target.
    pub fn from_env() -> Result<Self> {
        let target = match env::var(TARGET_ENV) {
            Ok(target) => target.parse()?,
            Err(_) => OffloadTarget::Nvptx64,
        };

        let mut options = Self::new(target);

        if let Ok(device_id) = env::var(DEVICE_ID_ENV) {
            options.device_id = parse_number(DEVICE_ID_ENV, &device_id)?;
        }

        if let Ok(barrier_id) = env::var(BARRIER_ID_ENV) {
            options = options.set_parallel_barrier_id(parse_number(BARRIER_ID_ENV, &barrier_id)?)?;
        }

        if let Ok(rules) = env::var(FORCE_BARRIER_ENV) {
            let rules = parse_barrier_rules(&rules)
                .with_context(|| format!("reading {FORCE_BARRIER_ENV}"))?;
            for rule in rules {
                options.capabilities = options.capabilities.with_rule(rule);
            }
        }

        Ok(options)
    }

    /// Set the target; the device capabilities are kept.
    #[must_use]
    pub fn set_target(mut self, target: OffloadTarget) -> Self {
        self.target = target;
        self
    }

    /// Set the device id encoded into offload entry names.
    #[must_use]
    pub fn set_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Set the named barrier used inside parallel regions.
    ///
    /// Barrier 0 belongs to the master/worker handshake, so the id must be
    /// in `1..16`.
    pub fn set_parallel_barrier_id(mut self, id: u32) -> Result<Self> {
        if id == 0 || id >= NAMED_BARRIER_COUNT {
            crate::bail!(ErrorKind::InvalidConfig {
                key: String::from(BARRIER_ID_ENV),
                value: id.to_string(),
                reason: format!("must be in 1..{NAMED_BARRIER_COUNT}"),
            });
        }

        self.parallel_barrier_id = id;
        Ok(self)
    }

    /// Replace the device capabilities.
    #[must_use]
    pub fn set_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// The device the module is compiled for.
    #[must_use]
    pub const fn target(&self) -> OffloadTarget {
        self.target
    }

    /// The device id encoded into offload entry names.
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id
    }

    /// The named barrier used inside parallel regions.
    #[must_use]
    pub const fn parallel_barrier_id(&self) -> u32 {
        self.parallel_barrier_id
    }

    /// What the device can elide at the end of loop constructs.
    #[must_use]
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self::new(OffloadTarget::Nvptx64)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };

    parsed.map_err(|err| {
        ErrorKind::InvalidConfig {
            key: key.to_owned(),
            value: value.to_owned(),
            reason: err.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{env, sync::Mutex};

    use super::{
        parse_number, CodegenOptions, OffloadTarget, BARRIER_ID_ENV, DEVICE_ID_ENV,
        FORCE_BARRIER_ENV, TARGET_ENV,
    };
    use crate::{
        directive::{Clause, DirectiveKind, ExecutableDirective, ScheduleKind},
        error::ErrorKind,
    };

    const ALL_ENV: [&str; 4] = [TARGET_ENV, DEVICE_ID_ENV, BARRIER_ID_ENV, FORCE_BARRIER_ENV];

    // the environment is process-wide, tests setting it must not interleave
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn from_env_with(vars: &[(&str, &str)]) -> crate::error::Result<CodegenOptions> {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        for key in ALL_ENV {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let options = CodegenOptions::from_env();

        for key in ALL_ENV {
            env::remove_var(key);
        }

        options
    }

    #[test]
    fn unset_environment_gives_the_defaults() {
        assert_eq!(from_env_with(&[]).unwrap(), CodegenOptions::default());
    }

    #[test]
    fn environment_sets_every_option() {
        let options = from_env_with(&[
            (TARGET_ENV, "host"),
            (DEVICE_ID_ENV, "0x1f"),
            (BARRIER_ID_ENV, "3"),
            (FORCE_BARRIER_ENV, "nowait+schedule(dynamic)"),
        ])
        .unwrap();

        assert_eq!(options.target(), OffloadTarget::Host);
        assert_eq!(options.device_id(), 0x1f);
        assert_eq!(options.parallel_barrier_id(), 3);

        let dynamic_nowait = ExecutableDirective::new(DirectiveKind::ParallelFor)
            .with_clause(Clause::Nowait)
            .with_clause(Clause::Schedule {
                kind: ScheduleKind::Dynamic,
                chunk: None,
            });
        assert!(options.capabilities().requires_barrier(&dynamic_nowait));
    }

    #[test]
    fn forced_barrier_rules_extend_the_target_defaults() {
        let options = from_env_with(&[(FORCE_BARRIER_ENV, "ordered; reduction")]).unwrap();
        assert_eq!(options.capabilities().barrier_rules.len(), 2);

        let reduction = ExecutableDirective::new(DirectiveKind::ParallelFor).with_clause(
            Clause::Reduction {
                op: crate::directive::ReductionOp::Add,
                var: crate::directive::VarId(0),
            },
        );
        assert!(options.capabilities().requires_barrier(&reduction));
    }

    #[test]
    fn invalid_environment_values_are_errors() {
        for (key, value) in [
            (TARGET_ENV, "amdgcn"),
            (DEVICE_ID_ENV, "ten"),
            (BARRIER_ID_ENV, "0"),
            (BARRIER_ID_ENV, "16"),
        ] {
            let err = from_env_with(&[(key, value)]).unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::InvalidConfig { key: found, .. } if found == key),
                "{key}={value}: {err}"
            );
        }
    }

    #[test]
    fn invalid_barrier_rules_keep_their_reason() {
        colored::control::set_override(false);

        let err = from_env_with(&[(FORCE_BARRIER_ENV, "ordered+collapse")]).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::InvalidConfig { reason, .. } if reason == "names the unknown clause 'collapse'"
        ));

        let rendered = err.to_string();
        assert!(rendered.contains(FORCE_BARRIER_ENV), "{rendered}");
        assert!(rendered.contains("collapse"), "{rendered}");

        colored::control::unset_override();
    }

    #[test]
    fn targets_parse_from_names_and_triples() {
        assert_eq!("host".parse::<OffloadTarget>().unwrap(), OffloadTarget::Host);
        assert_eq!(
            "nvptx64-nvidia-cuda".parse::<OffloadTarget>().unwrap(),
            OffloadTarget::Nvptx64
        );
        assert!("amdgcn".parse::<OffloadTarget>().is_err());
    }

    #[test]
    fn barrier_zero_is_reserved() {
        let err = CodegenOptions::default()
            .set_parallel_barrier_id(0)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidConfig { .. }));
        assert!(CodegenOptions::default().set_parallel_barrier_id(16).is_err());
        assert!(CodegenOptions::default().set_parallel_barrier_id(15).is_ok());
    }

    #[test]
    fn default_capabilities_follow_the_target() {
        let nvptx = CodegenOptions::new(OffloadTarget::Nvptx64);
        let host = CodegenOptions::new(OffloadTarget::Host);
        assert_eq!(nvptx.capabilities().barrier_rules.len(), 1);
        assert!(host.capabilities().barrier_rules.is_empty());
    }

    #[test]
    fn numbers_accept_hex() {
        assert_eq!(parse_number("k", "0x10").unwrap(), 16);
        assert_eq!(parse_number("k", "42").unwrap(), 42);
        assert!(parse_number("k", "x").is_err());
    }
}
