//! Sanitizer laws: idempotence and no-growth, under arbitrary input.

use proptest::prelude::*;

use autoelective::fixtures::{sanitize_bytes, sanitize_text, scan_for_leaks};

proptest! {
    #[test]
    fn sanitize_is_idempotent(input in ".{0,400}", id in "[0-9]{4,12}") {
        let once = sanitize_text(&input, Some(&id));
        let twice = sanitize_text(&once, Some(&id));
        prop_assert_eq!(&once, &twice);
    }

    #[test]
    fn sanitize_never_grows(input in ".{0,400}", id in "[0-9]{4,12}") {
        let clean = sanitize_text(&input, Some(&id));
        prop_assert!(clean.len() <= input.len());
    }

    #[test]
    fn sanitized_output_scans_clean(
        token in "[A-Za-z0-9]{1,40}",
        cookie in "[A-Z0-9]{1,60}",
        id in "[0-9]{8,10}",
    ) {
        let dirty = format!(
            "GET /SupplyCancel?xh={id}&token={token} HTTP/1.1\nCookie: JSESSIONID={cookie}\nbody {id}"
        );
        let clean = sanitize_text(&dirty, Some(&id));
        let findings = scan_for_leaks(&clean, Some(&id));
        prop_assert!(findings.is_empty(), "findings: {findings:?} in {clean:?}");
    }

    #[test]
    fn binary_bodies_pass_through(body in proptest::collection::vec(any::<u8>(), 2..200)) {
        // Force a non-text head so the sniffing keeps it binary.
        let mut raw = vec![0xFF, 0xD8];
        raw.extend(body);
        prop_assert_eq!(sanitize_bytes(&raw, None, Some("123456")), raw);
    }
}
