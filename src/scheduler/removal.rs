//! Choice of the node to remove when a cluster shrinks

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::cluster::Node;
use crate::config::RemovalPolicyKind;

pub trait RemovalPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one of `nodes` for removal, `None` if `nodes` is empty
    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node>;
}

/// Random replica; the primary only when no replica is left
pub struct PrimaryAvoiding;

impl RemovalPolicy for PrimaryAvoiding {
    fn name(&self) -> &'static str {
        "primary-avoiding"
    }

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        let replicas: Vec<&Node> = nodes.iter().filter(|n| !n.is_primary()).collect();
        match replicas.choose(&mut rand::thread_rng()) {
            Some(node) => Some(*node),
            None => nodes.first(),
        }
    }
}

/// Any node at random, primary included
pub struct RandomNode;

impl RemovalPolicy for RandomNode {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        nodes.choose(&mut rand::thread_rng())
    }
}

pub fn policy_for(kind: RemovalPolicyKind) -> Arc<dyn RemovalPolicy> {
    match kind {
        RemovalPolicyKind::PrimaryAvoiding => Arc::new(PrimaryAvoiding),
        RemovalPolicyKind::Random => Arc::new(RandomNode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Role;

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("a", "p", "s"),
            Node::new("b", "p", "s").with_role(Role::Primary),
            Node::new("c", "p", "s"),
        ]
    }

    #[test]
    fn test_primary_avoiding_never_picks_primary_while_replicas_exist() {
        let nodes = nodes();
        for _ in 0..50 {
            let chosen = PrimaryAvoiding.select(&nodes).unwrap();
            assert!(!chosen.is_primary());
        }
    }

    #[test]
    fn test_primary_avoiding_falls_back_to_primary() {
        let nodes = vec![Node::new("a", "p", "s").with_role(Role::Primary)];
        assert!(PrimaryAvoiding.select(&nodes).unwrap().is_primary());
        assert!(PrimaryAvoiding.select(&[]).is_none());
    }

    #[test]
    fn test_random_node_picks_from_all() {
        let nodes = nodes();
        let chosen = RandomNode.select(&nodes).unwrap();
        assert!(nodes.iter().any(|n| n.id == chosen.id));
        assert_eq!(policy_for(RemovalPolicyKind::Random).name(), "random");
        assert_eq!(
            policy_for(RemovalPolicyKind::default()).name(),
            "primary-avoiding"
        );
    }
}
