use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use stackwatch_core::{Deployment, Image};

use super::{
    Indexer, Query, Searcher, CONTAINER_PRIVILEGED, DEPLOYMENT_CLUSTER, DEPLOYMENT_NAME,
    DEPLOYMENT_NAMESPACE, IMAGE_REGISTRY, IMAGE_REMOTE, IMAGE_TAG,
};
use crate::entity::EntityRef;
use crate::error::Result;

/// A deployment flattened into multi-valued named fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: BTreeMap<&'static str, BTreeSet<String>>,
}

impl Document {
    pub fn from_deployment(deployment: &Deployment, images: &[Image]) -> Self {
        let mut doc = Document::default();
        doc.add(DEPLOYMENT_NAME, &deployment.name);
        doc.add(DEPLOYMENT_NAMESPACE, &deployment.namespace);
        doc.add(DEPLOYMENT_CLUSTER, &deployment.cluster_name);

        let entity = EntityRef::Deployment { deployment, images };
        for running in entity.container_images() {
            doc.add(IMAGE_REGISTRY, &running.image.name.registry);
            doc.add(IMAGE_REMOTE, &running.image.name.remote);
            doc.add(IMAGE_TAG, &running.image.name.tag);
            if let Some(container) = running.container {
                let privileged = container.security_context.privileged.to_string();
                doc.add(CONTAINER_PRIVILEGED, &privileged);
            }
        }
        doc
    }

    fn add(&mut self, field: &'static str, value: &str) {
        self.fields
            .entry(field)
            .or_default()
            .insert(value.to_string());
    }

    pub fn values(&self, field: &str) -> impl Iterator<Item = &str> {
        self.fields
            .get(field)
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    pub fn matches(&self, query: &Query) -> bool {
        query
            .clauses()
            .iter()
            .all(|clause| self.values(&clause.field).any(|v| clause.value.matches(v)))
    }
}

/// In-process index of deployment documents keyed by deployment id.
///
/// Used both as the durable index of the worker and as the throw-away index
/// built for a single deploy-time detection call.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: RwLock<BTreeMap<String, Document>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index holding exactly one deployment.
    pub fn for_deployment(deployment: &Deployment, images: &[Image]) -> Self {
        let index = Self::new();
        index.index_deployment(deployment, images);
        index
    }

    pub fn index_deployment(&self, deployment: &Deployment, images: &[Image]) {
        let doc = Document::from_deployment(deployment, images);
        self.docs
            .write()
            .expect("index lock poisoned")
            .insert(deployment.id.clone(), doc);
    }

    pub fn remove(&self, deployment_id: &str) -> bool {
        self.docs
            .write()
            .expect("index lock poisoned")
            .remove(deployment_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.docs.read().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Searcher for MemoryIndex {
    fn search(&self, query: &Query) -> Result<Vec<String>> {
        query.validate()?;
        let docs = self.docs.read().expect("index lock poisoned");
        Ok(docs
            .iter()
            .filter(|(_, doc)| doc.matches(query))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

impl Indexer for MemoryIndex {
    fn index_deployment(&self, deployment: &Deployment, images: &[Image]) {
        MemoryIndex::index_deployment(self, deployment, images);
    }

    fn remove_deployment(&self, deployment_id: &str) {
        self.remove(deployment_id);
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;
    use stackwatch_core::ImageName;

    use super::*;
    use crate::search::ValueMatch;

    fn deployment(id: &str, namespace: &str, image: &str, privileged: bool) -> Deployment {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("{id}-app"),
            "namespace": namespace,
            "containers": [{
                "name": "main",
                "image": { "name": ImageName::parse(image) },
                "securityContext": { "privileged": privileged }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn flattens_containers_and_metadata() {
        let d = deployment("d1", "prod", "nginx", true);
        let doc = Document::from_deployment(&d, &[]);
        assert_eq!(doc.values(IMAGE_TAG).collect::<Vec<_>>(), vec!["latest"]);
        assert_eq!(doc.values(IMAGE_REMOTE).collect::<Vec<_>>(), vec!["library/nginx"]);
        assert_eq!(doc.values(CONTAINER_PRIVILEGED).collect::<Vec<_>>(), vec!["true"]);
        assert_eq!(doc.values(DEPLOYMENT_NAMESPACE).collect::<Vec<_>>(), vec!["prod"]);
    }

    #[test]
    fn search_applies_every_clause() {
        let index = MemoryIndex::new();
        index.index_deployment(&deployment("d1", "prod", "nginx", true), &[]);
        index.index_deployment(&deployment("d2", "prod", "nginx:1.25", true), &[]);
        index.index_deployment(&deployment("d3", "dev", "nginx", false), &[]);

        let latest = Query::all().with(IMAGE_TAG, ValueMatch::Regex(Regex::new("^latest$").unwrap()));
        assert_eq!(index.search(&latest).unwrap(), vec!["d1", "d3"]);

        let privileged_latest = latest.with(CONTAINER_PRIVILEGED, ValueMatch::Exact("true".into()));
        assert_eq!(index.search(&privileged_latest).unwrap(), vec!["d1"]);

        assert_eq!(index.search(&Query::all()).unwrap().len(), 3);
    }

    #[test]
    fn removal_and_malformed_queries() {
        let index = MemoryIndex::for_deployment(&deployment("d1", "prod", "nginx", false), &[]);
        assert_eq!(index.len(), 1);

        let bad = Query::all().with("owner", ValueMatch::Exact("me".into()));
        assert!(index.search(&bad).is_err());

        assert!(index.remove("d1"));
        assert!(!index.remove("d1"));
        assert!(index.is_empty());
    }
}
