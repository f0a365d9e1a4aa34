//! Backfill ordering for one step.
//!
//! Tables deriving their tenant from another table of the same step must be filled
//! after that table. Parents outside the step are expected to be isolated already.

use std::collections::HashMap;

use crate::migrate::{MigrateError, TenantColumnPlan};

/// Topological order over the step's tables; ties keep declaration order.
pub(crate) fn backfill_order(plans: &[TenantColumnPlan]) -> Result<Vec<&TenantColumnPlan>, MigrateError> {
    let index: HashMap<&str, usize> = plans
        .iter()
        .enumerate()
        .map(|(i, p)| (p.table.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; plans.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); plans.len()];
    for (child, plan) in plans.iter().enumerate() {
        if let Some(&parent) = plan.parent_table().and_then(|t| index.get(t)) {
            children[parent].push(child);
            indegree[child] += 1;
        }
    }

    let mut done = vec![false; plans.len()];
    let mut order = Vec::with_capacity(plans.len());
    while order.len() < plans.len() {
        // Lowest declaration index among the ready nodes.
        let Some(next) = (0..plans.len()).find(|&i| !done[i] && indegree[i] == 0) else {
            let tables = (0..plans.len())
                .filter(|&i| !done[i])
                .map(|i| plans[i].table.clone())
                .collect();
            return Err(MigrateError::BackfillCycle { tables });
        };
        done[next] = true;
        for &c in &children[next] {
            indegree[c] -= 1;
        }
        order.push(&plans[next]);
    }
    Ok(order)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::migrate::TenantSource;

    fn parent(table: &str, parent: &str) -> TenantColumnPlan {
        TenantColumnPlan::new(
            table,
            TenantSource::Parent {
                foreign_key: format!("{parent}_id"),
                parent_table: parent.to_owned(),
                parent_key: "id".to_owned(),
                parent_tenant_column: "tenant_id".to_owned(),
            },
        )
    }

    fn names(order: &[&TenantColumnPlan]) -> Vec<String> {
        order.iter().map(|p| p.table.clone()).collect()
    }

    #[test]
    fn children_follow_parents() {
        let plans = vec![
            parent("ticket_history", "tickets"),
            parent("tickets", "clients"),
            TenantColumnPlan::new("clients", TenantSource::Existing),
        ];
        let order = backfill_order(&plans).unwrap();
        assert_eq!(names(&order), ["clients", "tickets", "ticket_history"]);
    }

    #[test]
    fn independent_tables_keep_declaration_order() {
        let plans = vec![
            TenantColumnPlan::new("b", TenantSource::Existing),
            parent("c", "outside"),
            TenantColumnPlan::new("a", TenantSource::Existing),
        ];
        let order = backfill_order(&plans).unwrap();
        assert_eq!(names(&order), ["b", "c", "a"]);
    }

    #[test]
    fn cycles_are_reported() {
        let plans = vec![parent("a", "b"), parent("b", "a"), TenantColumnPlan::new("c", TenantSource::Existing)];
        match backfill_order(&plans) {
            Err(MigrateError::BackfillCycle { tables }) => assert_eq!(tables, ["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }
}
