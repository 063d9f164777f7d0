use crate::log_info;
use crate::status::Status;
use crate::task::Task;

/// Propagate a completion: every task depending on `completed_id` gains a
/// satisfied entry. Satisfaction only ever grows.
pub fn mark_dependency_satisfied(tasks: &mut [Task], completed_id: u32) {
    for task in tasks.iter_mut() {
        task.mark_dependency_satisfied(completed_id);
    }
}

/// A task may submit only while every dependency is satisfied. Checked
/// immediately before each submission attempt, never cached.
pub fn is_eligible(task: &Task) -> bool {
    !task.has_unsatisfied_dependencies()
}

/// Cancel every still-pending task depending on `failed_id`, transitively.
/// Each cancellation carries a reason naming its direct upstream cause, so
/// a chain A -> B -> C reads "A failed" on B and "task B was canceled"
/// on C.
pub fn cancel_dependents_of(tasks: &mut [Task], failed_id: u32, reason: &str) {
    let mut queue: Vec<(u32, String)> = vec![(failed_id, reason.to_string())];

    while let Some((upstream_id, upstream_reason)) = queue.pop() {
        for task in tasks.iter_mut() {
            if task.status() == Status::Pending && task.dependencies.contains_key(&upstream_id) {
                log_info!("Canceling {}: {}", task.description(), upstream_reason);
                task.state.cancel(upstream_reason.clone());
                queue.push((task.id, format!("{} was canceled", task.description())));
            }
        }
    }
}
