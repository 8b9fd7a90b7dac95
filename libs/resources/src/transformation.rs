//! Offer operations that change resource metadata without changing quantities.

use serde::{Deserialize, Serialize};

use crate::resource::Resource;
use crate::{Resources, ResourcesError};

/// An operation a framework performs on offered or allocated resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "resources", rename_all = "snake_case")]
pub enum Transformation {
    /// Dynamically reserve unreserved resources.
    Reserve(Resources),
    /// Return dynamically reserved resources to the unreserved pool.
    Unreserve(Resources),
    /// Turn reserved disk into persistent volumes.
    CreateVolume(Resources),
    /// Turn persistent volumes back into plain disk.
    DestroyVolume(Resources),
}

impl Transformation {
    pub fn name(&self) -> &'static str {
        match self {
            Transformation::Reserve(_) => "RESERVE",
            Transformation::Unreserve(_) => "UNRESERVE",
            Transformation::CreateVolume(_) => "CREATE",
            Transformation::DestroyVolume(_) => "DESTROY",
        }
    }
}

fn strip_disk(resource: &Resource) -> Resource {
    let mut stripped = resource.clone();
    stripped.disk = None;
    stripped
}

impl Resources {
    /// Applies `operation`, returning the transformed resources.
    ///
    /// Fails without modifying anything if the operation references
    /// resources that are not present or are of the wrong shape. The result
    /// always has the same scalar quantities as the input.
    pub fn apply(&self, operation: &Transformation) -> Result<Resources, ResourcesError> {
        let op = operation.name();
        let fail = |reason: String| ResourcesError::Transformation {
            operation: op,
            reason,
        };
        let mut result = self.clone();

        match operation {
            Transformation::Reserve(resources) => {
                for resource in resources {
                    if !resource.is_dynamically_reserved() {
                        return Err(fail(format!("'{resource}' is not dynamically reserved")));
                    }
                    let unreserved = Resources::from(resource.clone()).flatten();
                    if !result.contains(&unreserved) {
                        return Err(fail(format!("{result} does not contain {unreserved}")));
                    }
                    result -= &unreserved;
                    result += resource;
                }
            }
            Transformation::Unreserve(resources) => {
                for resource in resources {
                    if !resource.is_dynamically_reserved() {
                        return Err(fail(format!("'{resource}' is not dynamically reserved")));
                    }
                    if !result.contains_resource(resource) {
                        return Err(fail(format!("{result} does not contain {resource}")));
                    }
                    let unreserved = Resources::from(resource.clone()).flatten();
                    result -= resource;
                    result += &unreserved;
                }
            }
            Transformation::CreateVolume(volumes) => {
                for volume in volumes {
                    if !volume.is_persistent_volume() {
                        return Err(fail(format!("'{volume}' is not a persistent volume")));
                    }
                    let stripped = strip_disk(volume);
                    if !result.contains_resource(&stripped) {
                        return Err(fail(format!("{result} does not contain {stripped}")));
                    }
                    result -= &stripped;
                    result += volume;
                }
            }
            Transformation::DestroyVolume(volumes) => {
                for volume in volumes {
                    if !volume.is_persistent_volume() {
                        return Err(fail(format!("'{volume}' is not a persistent volume")));
                    }
                    if !result.contains_resource(volume) {
                        return Err(fail(format!("persistent volume {volume} does not exist")));
                    }
                    result -= volume;
                    result += &strip_disk(volume);
                }
            }
        }

        if result.create_stripped_scalar_quantity() != self.create_stripped_scalar_quantity() {
            return Err(fail(format!(
                "result {result} changes the quantities of {self}"
            )));
        }
        Ok(result)
    }
}
