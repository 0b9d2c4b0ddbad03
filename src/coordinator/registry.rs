//! Ownership registry: who serves which path
//!
//! Two disjoint sub-maps index the union tree: exact objects by full name
//! and dynamic lists by prefix (names always ending in `.`). The maps never
//! overlap and no exact name may lie inside a registered prefix; every
//! mutation validates the whole batch before touching either map, so a
//! refused Register or UpdateObjects leaves the registry untouched.

use std::collections::HashMap;

use super::link::SourceLink;
use crate::error::{Error, Result};
use crate::message::Object;

/// A registered object together with the name of the source serving it
#[derive(Debug, Clone)]
pub(crate) struct OwnedObject {
    pub object: Object,
    pub owner: String,
}

/// How a request for a path reaches its owner
#[derive(Debug)]
pub(crate) struct Route {
    pub owner: String,
    pub object: Object,
    /// True when the path resolved through a dynamic list prefix rather
    /// than a direct exact entry
    pub via_dynamic: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub sources: HashMap<String, SourceLink>,
    pub objects: HashMap<String, OwnedObject>,
    pub dynamic_lists: HashMap<String, OwnedObject>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The source owning `name` as an exact entry or dynamic list root
    pub fn owner_of(&self, name: &str) -> Option<&str> {
        self.objects
            .get(name)
            .or_else(|| self.dynamic_lists.get(name))
            .map(|owned| owned.owner.as_str())
    }

    /// Validate that `incoming` can be installed without violating
    /// ownership uniqueness
    ///
    /// Entries owned by `exclude_owner` are ignored, so a re-registration or
    /// update is checked against the registry as it will look once that
    /// source's old set is gone. The batch is also checked against itself.
    pub fn validate_add(&self, incoming: &[Object], exclude_owner: Option<&str>) -> Result<()> {
        let retained = |owned: &&OwnedObject| exclude_owner.is_none_or(|owner| owned.owner != owner);

        let mut exact: Vec<&str> = self
            .objects
            .values()
            .filter(retained)
            .map(|owned| owned.object.name.as_str())
            .collect();
        let mut prefixes: Vec<&str> = self
            .dynamic_lists
            .values()
            .filter(retained)
            .map(|owned| owned.object.name.as_str())
            .collect();

        for object in incoming {
            let name = object.name.as_str();
            if exact.contains(&name) || prefixes.contains(&name) {
                return Err(Error::Conflict(format!(
                    "failed to add objects: object ({name}) already exists"
                )));
            }

            if object.is_dynamic_list() {
                if let Some(shadowed) = exact.iter().find(|existing| existing.starts_with(name)) {
                    return Err(Error::Conflict(format!(
                        "failed to add objects: dynamic list ({name}) conflicts with object ({shadowed})"
                    )));
                }
                if let Some(overlap) = prefixes
                    .iter()
                    .find(|existing| existing.starts_with(name) || name.starts_with(*existing))
                {
                    return Err(Error::Conflict(format!(
                        "failed to add objects: dynamic list ({name}) conflicts with dynamic list ({overlap})"
                    )));
                }
                prefixes.push(name);
            } else {
                if let Some(prefix) = prefixes.iter().find(|existing| name.starts_with(*existing)) {
                    return Err(Error::Conflict(format!(
                        "failed to add objects: object ({name}) falls under dynamic list ({prefix})"
                    )));
                }
                exact.push(name);
            }
        }

        Ok(())
    }

    /// Install a validated batch for `owner`
    pub fn install(&mut self, owner: &str, objects: &[Object]) {
        for object in objects {
            let owned = OwnedObject {
                object: object.clone(),
                owner: owner.to_string(),
            };
            if object.is_dynamic_list() {
                self.dynamic_lists.insert(object.name.clone(), owned);
            } else {
                self.objects.insert(object.name.clone(), owned);
            }
        }
    }

    /// Remove the given objects previously installed for a source
    pub fn remove_owned(&mut self, objects: &[Object]) {
        for object in objects {
            if object.is_dynamic_list() {
                self.dynamic_lists.remove(&object.name);
            } else {
                self.objects.remove(&object.name);
            }
        }
    }

    /// Resolve the source that serves `name`
    ///
    /// Exact entries win; then an exact dynamic list root; then the longest
    /// registered prefix of the name, with the object synthesized on demand.
    pub fn route(&self, name: &str) -> Result<Route> {
        if let Some(owned) = self.objects.get(name) {
            return Ok(Route {
                owner: owned.owner.clone(),
                object: owned.object.clone(),
                via_dynamic: false,
            });
        }

        if let Some(owned) = self.dynamic_lists.get(name) {
            return Ok(Route {
                owner: owned.owner.clone(),
                object: owned.object.clone(),
                via_dynamic: true,
            });
        }

        let longest = self
            .dynamic_lists
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some((_, owned)) = longest {
            return Ok(Route {
                owner: owned.owner.clone(),
                object: Object::named(name),
                via_dynamic: true,
            });
        }

        Err(Error::ObjectNotFound(name.to_string()))
    }

    /// Enumerate registered exact objects at `path`
    ///
    /// A path ending in `.` lists everything under the prefix; otherwise the
    /// path must name a registered exact object.
    pub fn list(&self, path: &str) -> Result<Vec<Object>> {
        if path.ends_with('.') {
            let objects: Vec<Object> = self
                .objects
                .iter()
                .filter(|(name, _)| name.starts_with(path))
                .map(|(_, owned)| owned.object.clone())
                .collect();
            return Ok(objects);
        }

        match self.objects.get(path) {
            Some(owned) => Ok(vec![owned.object.clone()]),
            None => Err(Error::ObjectNotFound(path.to_string())),
        }
    }

    /// Partition an UpdateObjects batch and validate it without mutating
    ///
    /// Fails if any incoming object is owned by a different source or the
    /// final set would violate ownership uniqueness.
    pub fn validate_update(&self, owner: &str, incoming: &[Object]) -> Result<UpdatePlan> {
        for object in incoming {
            if let Some(other) = self.owner_of(&object.name)
                && other != owner
            {
                return Err(Error::Conflict(format!(
                    "failed to add objects: object ({}) already exists and is owned by {other}",
                    object.name
                )));
            }
        }
        self.validate_add(incoming, Some(owner))?;

        let current = match self.sources.get(owner) {
            Some(link) => link.objects.clone(),
            None => Vec::new(),
        };
        let incoming_names: Vec<&str> = incoming.iter().map(|object| object.name.as_str()).collect();
        let deleted: HashMap<String, Object> = current
            .into_iter()
            .filter(|object| !incoming_names.contains(&object.name.as_str()))
            .map(|object| (object.name.clone(), object))
            .collect();

        Ok(UpdatePlan {
            incoming: incoming.to_vec(),
            deleted,
        })
    }

    /// Apply a validated update: the source's registry entries become
    /// exactly the plan's incoming set
    pub fn apply_update(&mut self, owner: &str, plan: &UpdatePlan) {
        let old_objects = match self.sources.get(owner) {
            Some(link) => link.objects.clone(),
            None => Vec::new(),
        };
        self.remove_owned(&old_objects);
        self.install(owner, &plan.incoming);
        if let Some(link) = self.sources.get_mut(owner) {
            link.objects = plan.incoming.clone();
        }
    }
}

/// Result of partitioning an UpdateObjects batch
#[derive(Debug)]
pub(crate) struct UpdatePlan {
    pub incoming: Vec<Object>,
    pub deleted: HashMap<String, Object>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ObjectAccess, ObjectType};

    fn object(name: &str) -> Object {
        Object::named(name)
    }

    fn dynamic(name: &str) -> Object {
        Object {
            name: name.to_string(),
            access: ObjectAccess::ReadOnly,
            object_type: ObjectType::DynamicList,
            indexable_from: None,
            value: None,
        }
    }

    fn registry_with(owner: &str, objects: &[Object]) -> Registry {
        let mut registry = Registry::new();
        registry.validate_add(objects, None).unwrap();
        registry.install(owner, objects);
        registry
    }

    /// No exact name may coexist with a prefix that covers it, in either
    /// installation order
    #[test]
    fn test_ownership_uniqueness() {
        let registry = registry_with("s1", &[object("Device.A"), dynamic("Device.Dyn.")]);

        assert!(registry.validate_add(&[object("Device.A")], None).is_err());
        assert!(registry.validate_add(&[dynamic("Device.Dyn.")], None).is_err());
        assert!(registry.validate_add(&[object("Device.Dyn.0.V1")], None).is_err());
        assert!(registry.validate_add(&[dynamic("Device.")], None).is_err());
        assert!(registry.validate_add(&[dynamic("Device.Dyn.0.")], None).is_err());
        assert!(registry.validate_add(&[object("Device.B")], None).is_ok());
        assert!(registry.validate_add(&[dynamic("Other.")], None).is_ok());
    }

    #[test]
    fn test_validate_add_checks_within_batch() {
        let registry = Registry::new();
        let batch = vec![dynamic("Device.Dyn."), object("Device.Dyn.0.V1")];
        assert!(registry.validate_add(&batch, None).is_err());

        let batch = vec![object("Device.A"), object("Device.A")];
        assert!(registry.validate_add(&batch, None).is_err());
    }

    #[test]
    fn test_validate_add_excludes_own_entries() {
        let registry = registry_with("s1", &[object("Device.A")]);
        // Re-registering the same name is fine once s1's old set is excluded
        assert!(registry.validate_add(&[object("Device.A")], Some("s1")).is_ok());
        assert!(registry.validate_add(&[object("Device.A")], Some("s2")).is_err());
    }

    /// Register followed by remove leaves the registry in its pre-state
    #[test]
    fn test_registry_symmetry() {
        let mut registry = Registry::new();
        let objects = vec![object("Device.A"), object("Device.B"), dynamic("Device.Dyn.")];

        registry.install("s1", &objects);
        assert_eq!(registry.objects.len(), 2);
        assert_eq!(registry.dynamic_lists.len(), 1);

        registry.remove_owned(&objects);
        assert!(registry.objects.is_empty());
        assert!(registry.dynamic_lists.is_empty());
    }

    #[test]
    fn test_route_exact_beats_prefix() {
        let mut registry = registry_with("s1", &[dynamic("Device.Dyn.")]);
        registry.install("s2", &[object("Device.Setting")]);

        let route = registry.route("Device.Setting").unwrap();
        assert_eq!(route.owner, "s2");
        assert!(!route.via_dynamic);

        let route = registry.route("Device.Dyn.").unwrap();
        assert_eq!(route.owner, "s1");
        assert!(route.via_dynamic);
    }

    #[test]
    fn test_route_longest_prefix_wins() {
        let mut registry = registry_with("s1", &[dynamic("Device.")]);
        // Install a nested prefix for another source directly; validation
        // would refuse it, which is exactly why routing must still prefer
        // the longest match if it ever observes one.
        registry.install("s2", &[dynamic("Device.Dyn.")]);

        let route = registry.route("Device.Dyn.0.V1").unwrap();
        assert_eq!(route.owner, "s2");
        assert_eq!(route.object.name, "Device.Dyn.0.V1");
        assert!(route.via_dynamic);
    }

    #[test]
    fn test_route_unknown_name() {
        let registry = Registry::new();
        let err = registry.route("Not.Valid").unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn test_list_prefix_and_exact() {
        let registry = registry_with(
            "s1",
            &[object("Device.Custom.Setting1"), object("Device.Custom.Setting2"), object("Other.X")],
        );

        let listed = registry.list("Device.Custom.").unwrap();
        assert_eq!(listed.len(), 2);

        let listed = registry.list("Other.X").unwrap();
        assert_eq!(listed.len(), 1);

        assert!(registry.list("Missing.Path").is_err());
    }

    #[test]
    fn test_validate_update_rejects_cross_source_names() {
        let mut registry = registry_with("s1", &[object("Device.A")]);
        registry.install("s2", &[object("Device.B")]);

        let err = registry.validate_update("s1", &[object("Device.B")]).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // Nothing changed
        assert_eq!(registry.owner_of("Device.B"), Some("s2"));
        assert_eq!(registry.owner_of("Device.A"), Some("s1"));
    }

    /// After an update the registry contains exactly the new set and the
    /// deleted partition equals old minus new
    #[tokio::test]
    async fn test_update_delta() {
        let mut registry = Registry::new();
        let initial = vec![object("Device.A"), object("Device.B"), object("Device.C")];
        let link = SourceLink::connect("s1", "tcp://127.0.0.1:19999", 4, 1024).unwrap();
        registry.sources.insert("s1".to_string(), link);
        registry.install("s1", &initial);
        registry.sources.get_mut("s1").unwrap().objects = initial.clone();

        let incoming = vec![object("Device.B"), object("Device.C"), object("Device.D")];
        let plan = registry.validate_update("s1", &incoming).unwrap();
        assert_eq!(plan.deleted.len(), 1);
        assert!(plan.deleted.contains_key("Device.A"));

        registry.apply_update("s1", &plan);
        assert!(!registry.objects.contains_key("Device.A"));
        assert!(registry.objects.contains_key("Device.D"));
        assert_eq!(registry.objects.len(), 3);
        assert_eq!(registry.sources.get("s1").unwrap().objects.len(), 3);
    }
}
