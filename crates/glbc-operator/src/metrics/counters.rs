//! Metric names and recording helpers

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const MANAGED_OBJECTS: &str = "glbc_ingress_managed_object_total";
pub const TIME_TO_ADMISSION: &str = "glbc_ingress_managed_object_time_to_admission";
pub const TLS_PENDING_REQUESTS: &str = "glbc_tls_certificate_pending_request_count";
pub const TLS_REQUESTS: &str = "glbc_tls_certificate_request_total";
pub const TLS_REQUEST_ERRORS: &str = "glbc_tls_certificate_request_errors_total";
pub const TLS_SECRETS: &str = "glbc_tls_certificate_secret_count";
pub const TLS_ISSUANCE_DURATION: &str = "glbc_tls_certificate_issuance_duration_seconds";
pub const RECONCILES: &str = "glbc_controller_reconcile_total";

pub const RESULT_SUCCEEDED: &str = "succeeded";
pub const RESULT_FAILED: &str = "failed";

/// Register help text for every family
pub fn describe() {
    describe_gauge!(MANAGED_OBJECTS, "Total number of managed ingress object");
    describe_histogram!(TIME_TO_ADMISSION, "Duration of the ingress object admission");
    describe_gauge!(
        TLS_PENDING_REQUESTS,
        "GLBC TLS certificate pending request count"
    );
    describe_counter!(TLS_REQUESTS, "GLBC TLS certificate total number of requests");
    describe_counter!(
        TLS_REQUEST_ERRORS,
        "GLBC TLS certificate total number of request errors"
    );
    describe_gauge!(TLS_SECRETS, "GLBC TLS certificate secret count");
    describe_histogram!(TLS_ISSUANCE_DURATION, "GLBC TLS certificate issuance duration");
    describe_counter!(RECONCILES, "Total number of reconciliations per controller");
}

/// Expose every per-issuer family at zero before the first request.
///
/// The issuance histogram is left out: it only appears once a certificate
/// has been issued or has failed.
pub fn initialize(issuer: &str) {
    gauge!(MANAGED_OBJECTS).set(0.0);
    gauge!(TLS_PENDING_REQUESTS, "issuer" => issuer.to_string()).set(0.0);
    for result in [RESULT_SUCCEEDED, RESULT_FAILED] {
        counter!(TLS_REQUESTS, "issuer" => issuer.to_string(), "result" => result).absolute(0);
    }
    counter!(TLS_REQUEST_ERRORS, "issuer" => issuer.to_string()).absolute(0);
    gauge!(TLS_SECRETS, "issuer" => issuer.to_string()).set(0.0);
}

pub fn set_managed_objects(count: usize) {
    gauge!(MANAGED_OBJECTS).set(count as f64);
}

pub fn record_admission(latency: Duration) {
    histogram!(TIME_TO_ADMISSION).record(latency.as_secs_f64());
}

pub fn certificate_requested(issuer: &str) {
    gauge!(TLS_PENDING_REQUESTS, "issuer" => issuer.to_string()).increment(1.0);
}

pub fn certificate_issued(issuer: &str, duration: Duration) {
    gauge!(TLS_PENDING_REQUESTS, "issuer" => issuer.to_string()).decrement(1.0);
    counter!(TLS_REQUESTS, "issuer" => issuer.to_string(), "result" => RESULT_SUCCEEDED)
        .increment(1);
    gauge!(TLS_SECRETS, "issuer" => issuer.to_string()).increment(1.0);
    histogram!(TLS_ISSUANCE_DURATION, "issuer" => issuer.to_string(), "result" => RESULT_SUCCEEDED)
        .record(duration.as_secs_f64());
}

pub fn certificate_failed(issuer: &str, duration: Duration) {
    gauge!(TLS_PENDING_REQUESTS, "issuer" => issuer.to_string()).decrement(1.0);
    counter!(TLS_REQUESTS, "issuer" => issuer.to_string(), "result" => RESULT_FAILED).increment(1);
    counter!(TLS_REQUEST_ERRORS, "issuer" => issuer.to_string()).increment(1);
    histogram!(TLS_ISSUANCE_DURATION, "issuer" => issuer.to_string(), "result" => RESULT_FAILED)
        .record(duration.as_secs_f64());
}

/// A pending request was dropped before completing
pub fn certificate_abandoned(issuer: &str) {
    gauge!(TLS_PENDING_REQUESTS, "issuer" => issuer.to_string()).decrement(1.0);
}

/// A secret is tracked without a new request, e.g. after a restart
pub fn secret_adopted(issuer: &str) {
    gauge!(TLS_SECRETS, "issuer" => issuer.to_string()).increment(1.0);
}

pub fn secret_released(issuer: &str) {
    gauge!(TLS_SECRETS, "issuer" => issuer.to_string()).decrement(1.0);
}

pub fn record_reconcile(controller: &'static str, success: bool) {
    let result = if success { "success" } else { "error" };
    counter!(RECONCILES, "controller" => controller, "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::build_recorder;

    fn render(f: impl FnOnce()) -> String {
        let recorder = build_recorder().unwrap();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, f);
        handle.render()
    }

    #[test]
    fn test_initialize_exposes_zeroed_families() {
        let output = render(|| {
            describe();
            initialize("glbc-ca");
        });

        assert!(output.contains("# HELP glbc_ingress_managed_object_total Total number of managed ingress object"));
        assert!(output.contains("glbc_ingress_managed_object_total 0"));
        assert!(output.contains(r#"glbc_tls_certificate_pending_request_count{issuer="glbc-ca"} 0"#));
        assert!(output.contains(
            r#"glbc_tls_certificate_request_total{issuer="glbc-ca",result="succeeded"} 0"#
        ));
        assert!(output.contains(
            r#"glbc_tls_certificate_request_total{issuer="glbc-ca",result="failed"} 0"#
        ));
        assert!(output.contains(r#"glbc_tls_certificate_request_errors_total{issuer="glbc-ca"} 0"#));
        assert!(output.contains(r#"glbc_tls_certificate_secret_count{issuer="glbc-ca"} 0"#));
        assert!(!output.contains("glbc_tls_certificate_issuance_duration_seconds_bucket"));
    }

    #[test]
    fn test_issuance_lifecycle() {
        let output = render(|| {
            initialize("glbc-ca");
            certificate_requested("glbc-ca");
            certificate_issued("glbc-ca", Duration::from_secs(3));
        });

        assert!(output.contains(r#"glbc_tls_certificate_pending_request_count{issuer="glbc-ca"} 0"#));
        assert!(output.contains(
            r#"glbc_tls_certificate_request_total{issuer="glbc-ca",result="succeeded"} 1"#
        ));
        assert!(output.contains(r#"glbc_tls_certificate_secret_count{issuer="glbc-ca"} 1"#));
        assert!(output.contains(
            r#"glbc_tls_certificate_issuance_duration_seconds_bucket{issuer="glbc-ca",result="succeeded",le="5"} 1"#
        ));
    }

    #[test]
    fn test_failure_counts_error() {
        let output = render(|| {
            initialize("glbc-ca");
            certificate_requested("glbc-ca");
            certificate_failed("glbc-ca", Duration::from_secs(1));
        });

        assert!(output.contains(
            r#"glbc_tls_certificate_request_total{issuer="glbc-ca",result="failed"} 1"#
        ));
        assert!(output.contains(r#"glbc_tls_certificate_request_errors_total{issuer="glbc-ca"} 1"#));
        assert!(output.contains(r#"glbc_tls_certificate_secret_count{issuer="glbc-ca"} 0"#));
    }

    #[test]
    fn test_admission_buckets() {
        let output = render(|| record_admission(Duration::from_secs(12)));

        assert!(output.contains(r#"glbc_ingress_managed_object_time_to_admission_bucket{le="10"} 0"#));
        assert!(output.contains(r#"glbc_ingress_managed_object_time_to_admission_bucket{le="15"} 1"#));
        assert!(output.contains(r#"glbc_ingress_managed_object_time_to_admission_bucket{le="300"} 1"#));
    }

    #[test]
    fn test_reconcile_counter() {
        let output = render(|| {
            record_reconcile("kcp-glbc-ingress", true);
            record_reconcile("kcp-glbc-ingress", true);
            record_reconcile("kcp-glbc-ingress", false);
        });

        assert!(output.contains(
            r#"glbc_controller_reconcile_total{controller="kcp-glbc-ingress",result="success"} 2"#
        ));
        assert!(output.contains(
            r#"glbc_controller_reconcile_total{controller="kcp-glbc-ingress",result="error"} 1"#
        ));
    }
}
