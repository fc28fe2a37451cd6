use redefine_base::MethodAccessFlags;

pub const ENV_TRACING_LEVEL: &str = "REDEFINE_LOG_LEVEL";
pub const DEFAULT_TRACING_LEVEL: tracing::Level = tracing::Level::WARN;

/// The width of a call site cache index as written into bytecode
pub const MAX_CACHE_INDEX_BITS: u8 = 16;

/// Which methods a redefinition may add or delete.
/// Anything that could change the shape of a vtable must stay put, so only methods which are
/// never dispatched virtually are candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodChangePolicy {
    /// Methods can't be added or removed at all
    Disallow,
    /// Private methods which are also static or final
    PrivateStaticOrFinal,
    /// Any private method
    Private,
}
impl MethodChangePolicy {
    #[must_use]
    pub fn allows(self, access_flags: MethodAccessFlags) -> bool {
        let private = access_flags.contains(MethodAccessFlags::PRIVATE);
        match self {
            MethodChangePolicy::Disallow => false,
            MethodChangePolicy::PrivateStaticOrFinal => {
                private
                    && access_flags.intersects(MethodAccessFlags::STATIC | MethodAccessFlags::FINAL)
            }
            MethodChangePolicy::Private => private,
        }
    }
}
impl Default for MethodChangePolicy {
    fn default() -> Self {
        MethodChangePolicy::PrivateStaticOrFinal
    }
}

#[derive(Debug, Clone)]
pub struct RedefineConfig {
    pub tracing_level: tracing::Level,
    pub method_change_policy: MethodChangePolicy,
    /// How many bits a call site cache index may use. At most [`MAX_CACHE_INDEX_BITS`].
    pub cache_index_bits: u8,
    /// Re-verify each candidate after it has been merged and rewritten, and check that the
    /// rewrite can be undone exactly
    pub verify_merged: bool,
    /// After fixing up, sweep every class for references to replaced methods
    pub check_fixups: bool,
}
impl RedefineConfig {
    #[must_use]
    pub fn new() -> RedefineConfig {
        let tracing_level = RedefineConfig::compute_tracing_level();
        RedefineConfig {
            tracing_level,
            method_change_policy: MethodChangePolicy::default(),
            cache_index_bits: MAX_CACHE_INDEX_BITS,
            verify_merged: cfg!(debug_assertions),
            check_fixups: cfg!(debug_assertions),
        }
    }

    #[must_use]
    pub fn compute_tracing_level() -> tracing::Level {
        let env_log = std::env::var(ENV_TRACING_LEVEL);
        if let Ok(env_log) = env_log {
            if env_log.eq_ignore_ascii_case("trace") || env_log == "*" {
                tracing::Level::TRACE
            } else if env_log.eq_ignore_ascii_case("info") {
                tracing::Level::INFO
            } else if env_log.eq_ignore_ascii_case("warn") {
                tracing::Level::WARN
            } else if env_log.eq_ignore_ascii_case("error") {
                tracing::Level::ERROR
            } else {
                DEFAULT_TRACING_LEVEL
            }
        } else {
            DEFAULT_TRACING_LEVEL
        }
    }

    /// The number of call site cache entries a class may have
    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        let bits = self.cache_index_bits.clamp(1, MAX_CACHE_INDEX_BITS);
        1 << bits
    }
}
impl Default for RedefineConfig {
    fn default() -> Self {
        Self::new()
    }
}
