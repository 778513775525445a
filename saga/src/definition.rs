//! Static saga definitions.

use std::time::Duration;

/// Step name constants for the booking saga.
pub mod steps {
    /// Pre-completed in the request path; compensated by releasing seats.
    pub const RESERVE_SEATS: &str = "reserve-seats";
    /// Pre-completed in the payment service; compensated by a refund.
    pub const PROCESS_PAYMENT: &str = "process-payment";
    /// Critical forward step executed by this saga.
    pub const CONFIRM_BOOKING: &str = "confirm-booking";
    /// Non-critical forward step executed by this saga.
    pub const SEND_NOTIFICATION: &str = "send-notification";

    /// Compensation command name for a step.
    #[must_use]
    pub fn compensation_for(step: &str) -> String {
        format!("compensate-{step}")
    }
}

/// One step of a saga definition.
#[derive(Clone, Debug)]
pub struct StepDef {
    /// Stable step name; also names the command and event topics.
    pub name: &'static str,
    /// Critical steps trigger reverse compensation on failure;
    /// non-critical ones are retried, dead-lettered, and skipped.
    pub critical: bool,
    /// Worker-side retry budget for the step command.
    pub max_retries: u32,
    /// Deadline for a success/failure event before the orchestrator
    /// treats the step as failed.
    pub timeout: Duration,
    /// Compensation command name, if this step can be undone.
    pub compensation: Option<&'static str>,
    /// Completed before the saga starts; recorded at creation so the
    /// compensator participates in rollback, but never commanded forward.
    pub pre_completed: bool,
}

/// An ordered list of steps making up one saga type.
#[derive(Clone, Debug)]
pub struct SagaDefinition {
    /// Definition id stored on every instance.
    pub id: &'static str,
    /// Steps in forward order.
    pub steps: Vec<StepDef>,
}

impl SagaDefinition {
    /// The post-payment booking saga.
    #[must_use]
    pub fn booking() -> Self {
        Self {
            id: "post-payment-booking",
            steps: vec![
                StepDef {
                    name: steps::RESERVE_SEATS,
                    critical: true,
                    max_retries: 0,
                    timeout: Duration::from_secs(30),
                    compensation: Some("compensate-reserve-seats"),
                    pre_completed: true,
                },
                StepDef {
                    name: steps::PROCESS_PAYMENT,
                    critical: true,
                    max_retries: 0,
                    timeout: Duration::from_secs(30),
                    compensation: Some("compensate-process-payment"),
                    pre_completed: true,
                },
                StepDef {
                    name: steps::CONFIRM_BOOKING,
                    critical: true,
                    max_retries: 3,
                    timeout: Duration::from_secs(30),
                    compensation: None,
                    pre_completed: false,
                },
                StepDef {
                    name: steps::SEND_NOTIFICATION,
                    critical: false,
                    max_retries: 5,
                    timeout: Duration::from_secs(30),
                    compensation: None,
                    pre_completed: false,
                },
            ],
        }
    }

    /// Look up a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Index of a step by name.
    #[must_use]
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name == name)
    }

    /// The first step the orchestrator must command.
    #[must_use]
    pub fn first_executable(&self) -> Option<&StepDef> {
        self.steps.iter().find(|step| !step.pre_completed)
    }

    /// The step commanded after `name` completes, if any.
    #[must_use]
    pub fn next_executable_after(&self, name: &str) -> Option<&StepDef> {
        let index = self.step_index(name)?;
        self.steps
            .iter()
            .skip(index + 1)
            .find(|step| !step.pre_completed)
    }

    /// Steps the orchestrator commands (non-pre-completed), in order.
    pub fn executable_steps(&self) -> impl Iterator<Item = &StepDef> {
        self.steps.iter().filter(|step| !step.pre_completed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn booking_saga_orders_confirm_before_notification() {
        let definition = SagaDefinition::booking();

        let first = definition.first_executable().unwrap();
        assert_eq!(first.name, steps::CONFIRM_BOOKING);
        assert!(first.critical);

        let second = definition
            .next_executable_after(steps::CONFIRM_BOOKING)
            .unwrap();
        assert_eq!(second.name, steps::SEND_NOTIFICATION);
        assert!(!second.critical);
        assert_eq!(second.max_retries, 5);

        assert!(
            definition
                .next_executable_after(steps::SEND_NOTIFICATION)
                .is_none()
        );
    }

    #[test]
    fn pre_completed_steps_carry_the_compensators() {
        let definition = SagaDefinition::booking();
        assert_eq!(
            definition.step(steps::RESERVE_SEATS).unwrap().compensation,
            Some("compensate-reserve-seats")
        );
        assert_eq!(
            definition.step(steps::PROCESS_PAYMENT).unwrap().compensation,
            Some("compensate-process-payment")
        );
        assert!(definition.step(steps::CONFIRM_BOOKING).unwrap().compensation.is_none());
    }

    #[test]
    fn compensation_names_follow_the_topic_convention() {
        assert_eq!(
            steps::compensation_for(steps::RESERVE_SEATS),
            "compensate-reserve-seats"
        );
    }
}
