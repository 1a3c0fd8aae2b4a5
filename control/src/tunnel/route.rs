//! Desired tunnel state for one Ingress

use crate::tunnel::link::TunnelLink;
use common::{ResourceKey, Rule, TunnelOptions};
use std::collections::HashMap;
use std::fmt;

/// One Route per observed Ingress: every valid rule mapped to its link
#[derive(Debug, Clone)]
pub struct Route {
    pub key: ResourceKey,
    pub options: TunnelOptions,
    pub links: HashMap<Rule, TunnelLink>,
}

impl Route {
    pub fn new(key: ResourceKey, options: TunnelOptions) -> Self {
        Self {
            key,
            options,
            links: HashMap::new(),
        }
    }

    pub fn insert(&mut self, link: TunnelLink) {
        self.links.insert(link.rule().clone(), link);
    }

    /// Rules in a stable order
    pub fn rules(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.links.keys().cloned().collect();
        rules.sort();
        rules
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({}): {} rule(s)", self.key, self.links.len())
    }
}
