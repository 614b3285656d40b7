use core::mem::take;

use crate::opts::{LdcCoreOpts, StackPolicy};

/// Context to run a program that loads contract code at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdcContext {
    /// The memory geometry and stack policy.
    pub opts: LdcCoreOpts,

    /// The code the program starts with, placed at the bottom of the code region.
    pub initial_code: Vec<u8>,

    /// The maximum number of loads a single execution may perform.
    pub max_loads: Option<usize>,
}

/// A builder for [`LdcContext`].
#[derive(Debug, Clone, Default)]
pub struct LdcContextBuilder {
    opts: Option<LdcCoreOpts>,
    stack_policy: Option<StackPolicy>,
    initial_code: Vec<u8>,
    max_loads: Option<usize>,
}

impl LdcContext {
    /// Create a new context builder. See [`LdcContextBuilder`] for more details.
    #[must_use]
    pub fn builder() -> LdcContextBuilder {
        LdcContextBuilder::new()
    }
}

impl LdcContextBuilder {
    /// Create a new [`LdcContextBuilder`].
    ///
    /// Prefer using [`LdcContext::builder`].
    #[must_use]
    pub fn new() -> Self {
        LdcContextBuilder::default()
    }

    /// Build and return the [`LdcContext`].
    ///
    /// Clears and resets the builder, allowing it to be reused.
    pub fn build(&mut self) -> LdcContext {
        let mut opts = take(&mut self.opts).unwrap_or_default();
        if let Some(stack_policy) = take(&mut self.stack_policy) {
            opts.stack_policy = stack_policy;
        }
        LdcContext {
            opts,
            initial_code: take(&mut self.initial_code),
            max_loads: take(&mut self.max_loads),
        }
    }

    /// Set the loader options.
    pub fn opts(&mut self, opts: LdcCoreOpts) -> &mut Self {
        self.opts = Some(opts);
        self
    }

    /// Override the stack policy of the options.
    pub fn stack_policy(&mut self, stack_policy: StackPolicy) -> &mut Self {
        self.stack_policy = Some(stack_policy);
        self
    }

    /// Set the code the program starts with.
    pub fn initial_code(&mut self, code: impl Into<Vec<u8>>) -> &mut Self {
        self.initial_code = code.into();
        self
    }

    /// Set the maximum number of loads a single execution may perform.
    pub fn max_loads(&mut self, max_loads: usize) -> &mut Self {
        self.max_loads = Some(max_loads);
        self
    }
}

#[cfg(test)]
mod tests {
    use ldc_primitives::MemoryGeometry;

    use crate::{LdcContext, LdcCoreOpts, StackPolicy};

    #[test]
    fn defaults() {
        let LdcContext { opts, initial_code, max_loads } = LdcContext::builder().build();
        assert_eq!(opts, LdcCoreOpts::default());
        assert!(initial_code.is_empty());
        assert!(max_loads.is_none());
    }

    #[test]
    fn stack_policy_overrides_opts() {
        let geometry = MemoryGeometry::new(1 << 20, 1 << 10).unwrap();
        let context = LdcContext::builder()
            .stack_policy(StackPolicy::Relocate)
            .opts(LdcCoreOpts { geometry, stack_policy: StackPolicy::Strict })
            .build();
        assert_eq!(context.opts.geometry, geometry);
        assert_eq!(context.opts.stack_policy, StackPolicy::Relocate);
    }

    #[test]
    fn builder_is_reset() {
        let mut builder = LdcContext::builder();
        let first = builder.initial_code(vec![1u8, 2, 3]).max_loads(4).build();
        assert_eq!(first.initial_code, [1, 2, 3]);
        assert_eq!(first.max_loads, Some(4));
        assert_eq!(builder.build(), LdcContext::default());
    }
}
