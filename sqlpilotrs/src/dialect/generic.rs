use super::{DialectAdapter, LimitMethod};

/// Fallback for backends without a registered adapter: ANSI quoting, no
/// time grains, limits applied by wrapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericDialect;

impl DialectAdapter for GenericDialect {
    fn engine(&self) -> &'static str {
        "generic"
    }

    fn limit_method(&self) -> LimitMethod {
        LimitMethod::WrapSql
    }
}
