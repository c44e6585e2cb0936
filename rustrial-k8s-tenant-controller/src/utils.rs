/// Prefix `name` with the controller's metric namespace.
pub(crate) fn metric_name(name: &str) -> String {
    format!("tenant_controller_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_metric_name() {
        assert_eq!("tenant_controller_reconcile_count", metric_name("reconcile_count"));
    }
}
