//! Text form of resources: `cpus:2;mem(role1):1024;ports:[31000-32000];zones:{a,b}`.

use std::collections::BTreeSet;

use crate::resource::{Range, Ranges, Resource, Value};
use crate::{Resources, ResourcesError};

pub(crate) fn parse(text: &str, default_role: &str) -> Result<Resources, ResourcesError> {
    let mut resources = Resources::new();
    for token in text.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        let resource = parse_resource(token, default_role)?;
        resource.validate()?;
        resources += &resource;
    }
    Ok(resources)
}

fn parse_resource(token: &str, default_role: &str) -> Result<Resource, ResourcesError> {
    let (key, value) = token
        .split_once(':')
        .ok_or_else(|| ResourcesError::parse(token, "expected 'name:value'"))?;

    let (name, role) = match key.split_once('(') {
        Some((name, rest)) => {
            let role = rest
                .strip_suffix(')')
                .ok_or_else(|| ResourcesError::parse(token, "unterminated role"))?;
            (name.trim(), role.trim())
        }
        None => (key.trim(), default_role),
    };
    if name.is_empty() {
        return Err(ResourcesError::parse(token, "empty resource name"));
    }
    if role.is_empty() {
        return Err(ResourcesError::parse(token, "empty role"));
    }

    let value = parse_value(value.trim()).map_err(|reason| ResourcesError::parse(token, reason))?;
    Ok(Resource {
        name: name.to_owned(),
        value,
        role: role.to_owned(),
        reservation: None,
        disk: None,
        revocable: false,
    })
}

fn parse_value(text: &str) -> Result<Value, String> {
    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| "unterminated range list".to_owned())?;
        return parse_ranges(inner).map(Value::Ranges);
    }
    if let Some(inner) = text.strip_prefix('{') {
        let inner = inner
            .strip_suffix('}')
            .ok_or_else(|| "unterminated set".to_owned())?;
        let items: BTreeSet<String> = inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        return Ok(Value::Set(items));
    }
    let scalar: f64 = text
        .parse()
        .map_err(|_| format!("'{text}' is not a number"))?;
    Ok(Value::Scalar(crate::resource::round_scalar(scalar)))
}

fn parse_ranges(text: &str) -> Result<Ranges, String> {
    let mut ranges = Vec::new();
    for part in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (begin, end) = match part.split_once('-') {
            Some((b, e)) => (b.trim(), e.trim()),
            None => (part, part),
        };
        let begin: u64 = begin
            .parse()
            .map_err(|_| format!("bad range bound '{begin}'"))?;
        let end: u64 = end.parse().map_err(|_| format!("bad range bound '{end}'"))?;
        if begin > end {
            return Err(format!("range {begin}-{end} is reversed"));
        }
        ranges.push(Range::new(begin, end));
    }
    Ok(Ranges::from(ranges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_mixed() {
        let resources =
            Resources::parse("cpus:2; mem(role1):1024; ports:[31000-32000, 1]; zones:{b, a}")
                .unwrap();
        assert_eq!(resources.len(), 4);
        assert_eq!(resources.cpus(), Some(2.0));
        assert_eq!(resources.reserved("role1").mem(), Some(1024.0));
        assert_eq!(
            resources.to_string(),
            "cpus(*):2; mem(role1):1024; ports(*):[1-1, 31000-32000]; zones(*):{a, b}"
        );
    }

    #[test]
    fn test_parse_with_role_defaults_unnamed_entries() {
        let resources = Resources::parse_with_role("cpus:2;mem(*):10", "role1").unwrap();
        assert_eq!(resources.reserved("role1").cpus(), Some(2.0));
        assert_eq!(resources.unreserved().mem(), Some(10.0));
    }

    #[test]
    fn test_duplicates_are_summed() {
        let resources = Resources::parse("cpus:1;cpus:2").unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources.cpus(), Some(3.0));
    }

    #[rstest]
    #[case("cpus")]
    #[case("cpus:abc")]
    #[case(":2")]
    #[case("cpus(role1:2")]
    #[case("cpus():2")]
    #[case("ports:[10-1]")]
    #[case("ports:[1-2")]
    #[case("cpus:-1")]
    fn test_parse_errors(#[case] input: &str) {
        assert!(Resources::parse(input).is_err(), "{input} should not parse");
    }
}
