use corral_resources::{validate_resource, ValueKind};

use super::{QuotaError, QuotaInfo};

/// Checks that a quota request is well formed and returns the role it
/// applies to.
///
/// Every guarantee entry must be a valid scalar without reservation, disk or
/// revocable metadata, and all entries must name the same role as the
/// request (or, when the request leaves its role empty, as the first entry).
pub fn validate(info: &QuotaInfo) -> Result<String, QuotaError> {
    let mut role = info.role.clone();

    for resource in &info.guarantee {
        if let Err(err) = validate_resource(resource) {
            return Err(QuotaError::invalid(format!(
                "Quota request with invalid resource: {err}"
            )));
        }
        if resource.reservation.is_some() {
            return Err(QuotaError::invalid(
                "Quota request may not contain ReservationInfo",
            ));
        }
        if resource.disk.is_some() {
            return Err(QuotaError::invalid("Quota request may not contain DiskInfo"));
        }
        if resource.revocable {
            return Err(QuotaError::invalid(
                "Quota request may not contain RevocableInfo",
            ));
        }
        if resource.kind() != ValueKind::Scalar {
            return Err(QuotaError::invalid(
                "Quota request may not include non-scalar resources",
            ));
        }

        if role.is_empty() {
            role = resource.role.clone();
        } else if role != resource.role {
            return Err(QuotaError::invalid(format!(
                "Quota request with different roles: '{role}','{}'",
                resource.role
            )));
        }
    }

    if role.is_empty() {
        return Err(QuotaError::invalid("Quota request with empty role specified"));
    }
    Ok(role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ErrorClass;
    use corral_resources::{Range, Resource, Resources};
    use rstest::rstest;

    fn guarantee(text: &str, role: &str) -> Vec<Resource> {
        Resources::parse_with_role(text, role).unwrap().into()
    }

    #[test]
    fn test_accepts_single_role_scalars() {
        let info = QuotaInfo::from_resources(guarantee("cpus:3;mem:1024", "R"));
        assert_eq!(validate(&info).unwrap(), "R");
    }

    #[test]
    fn test_request_role_is_reference() {
        let info = QuotaInfo::new("R", guarantee("cpus:1", "R"));
        assert_eq!(validate(&info).unwrap(), "R");

        let info = QuotaInfo::new("R", guarantee("cpus:1", "S"));
        let err = validate(&info).unwrap_err().to_string();
        assert_eq!(err, "Quota request with different roles: 'R','S'");
    }

    #[test]
    fn test_rejects_mixed_roles_in_either_order() {
        let a = Resource::scalar("cpus", 1.0).with_role("A");
        let b = Resource::scalar("mem", 512.0).with_role("B");

        for request in [
            QuotaInfo::from_resources([a.clone(), b.clone()]),
            QuotaInfo::from_resources([b, a]),
        ] {
            let err = validate(&request).unwrap_err();
            let message = err.to_string();
            assert!(message.contains("different roles"), "{message}");
            assert!(message.contains("'A'") && message.contains("'B'"), "{message}");
        }
    }

    #[rstest]
    #[case::reservation(
        Resource::scalar("cpus", 1.0).with_role("R").reserved_by(Some("ops")),
        "ReservationInfo"
    )]
    #[case::disk(
        Resource::scalar("disk", 10.0).with_role("R").with_volume("id", "path"),
        "DiskInfo"
    )]
    #[case::revocable(Resource::scalar("cpus", 1.0).with_role("R").into_revocable(), "RevocableInfo")]
    #[case::ranges(
        Resource::ranges("ports", vec![Range::new(1, 2)]).with_role("R"),
        "non-scalar"
    )]
    #[case::set(Resource::set("zones", ["a"]).with_role("R"), "non-scalar")]
    #[case::negative(Resource::scalar("cpus", -1.0).with_role("R"), "invalid resource")]
    #[case::empty_name(Resource::scalar("", 1.0).with_role("R"), "invalid resource")]
    fn test_rejects_bad_resource(#[case] resource: Resource, #[case] expected: &str) {
        let err = validate(&QuotaInfo::from_resources([resource])).unwrap_err();
        assert!(err.to_string().contains(expected), "{err}");
        assert_eq!(err.class(), ErrorClass::BadRequest);
    }

    #[test]
    fn test_rejects_empty_role() {
        let err = validate(&QuotaInfo::new("", Vec::<Resource>::new())).unwrap_err();
        assert_eq!(err.to_string(), "Quota request with empty role specified");
    }

    #[test]
    fn test_validation_is_repeatable() {
        let info = QuotaInfo::from_resources(guarantee("cpus:2;mem:64", "R"));
        assert_eq!(validate(&info).unwrap(), validate(&info).unwrap());
    }
}
