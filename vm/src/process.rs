//! The top-level process driver: activate the image's initial method
//! and fold every outcome into an exit status.

use object::{Method, Value};

use crate::{alloc, dispatch, Control, Runtime, RuntimeError};

#[derive(Debug)]
pub enum ProcessOutcome {
    /// The initial method returned normally.
    Returned(Value),
    /// A non-local return escaped every activation. Reported as a
    /// process error; the host survives.
    UncaughtNonLocal { value: Value },
    Failed(RuntimeError),
}

/// Exit codes, one per error family. The host binary uses the same
/// constants for failures that happen before a runtime exists
/// (unreadable or malformed image, invalid configuration).
pub mod codes {
    pub const OK: i32 = 0;
    /// Any runtime failure without a dedicated family.
    pub const RUNTIME_FAILURE: i32 = 1;
    pub const ALLOCATION_FAILED: i32 = 2;
    pub const UNCAUGHT_NON_LOCAL: i32 = 3;
    pub const MISSING_DNU: i32 = 4;
    /// Cannot start: image unreadable, malformed, without an initial
    /// method, or the memory configuration is invalid.
    pub const INITIALIZATION_FAILED: i32 = 5;
}

/// Send the initial method's selector to nil, catching whatever falls
/// out the bottom.
pub fn execute_process(rt: &mut Runtime) -> ProcessOutcome {
    let method = rt.globals.initial_method;
    if !method.is_ref() || method == rt.globals.nil {
        return ProcessOutcome::Failed(RuntimeError::MissingInitialMethod);
    }
    let selector = unsafe { method.as_ref::<Method>() }.name;
    let nil = rt.globals.nil;
    let arguments = match alloc::new_array_of(rt, &[nil]) {
        Ok(arguments) => arguments,
        Err(e) => return ProcessOutcome::Failed(e),
    };

    match dispatch::send_message(rt, nil, selector, arguments, None) {
        Ok(Control::Normal(value)) => ProcessOutcome::Returned(value),
        Ok(Control::NonLocal { value, .. }) => {
            tracing::error!("non-local return escaped the process");
            ProcessOutcome::UncaughtNonLocal { value }
        }
        Err(e) => {
            tracing::error!(error = %e, "process failed");
            ProcessOutcome::Failed(e)
        }
    }
}

/// Exit status for the host: 0 on a normal return, a distinct
/// [`codes`] constant per unrecoverable error family.
pub fn exit_code(outcome: &ProcessOutcome) -> i32 {
    match outcome {
        ProcessOutcome::Returned(_) => codes::OK,
        ProcessOutcome::UncaughtNonLocal { .. } => codes::UNCAUGHT_NON_LOCAL,
        ProcessOutcome::Failed(RuntimeError::Allocation(_)) => codes::ALLOCATION_FAILED,
        ProcessOutcome::Failed(RuntimeError::NoDoesNotUnderstand { .. }) => {
            codes::MISSING_DNU
        }
        ProcessOutcome::Failed(RuntimeError::MissingInitialMethod) => {
            codes::INITIALIZATION_FAILED
        }
        ProcessOutcome::Failed(_) => codes::RUNTIME_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::special;
    use bytecode::BytecodeBuilder;
    use heap::MemoryConfig;
    use object::class_of;

    #[test]
    fn process_returns_the_initial_method_result() {
        let mut rt = special::bootstrap(MemoryConfig::default());

        let mut b = BytecodeBuilder::new();
        b.push_constant(6);
        b.push_constant(7);
        b.send_binary(2);
        b.stack_return();
        let class = class_of(rt.globals.nil, &rt.globals);
        let method =
            special::install_method(&mut rt, class, "boot", &[], b.as_bytes(), 0, 4)
                .expect("install");
        rt.globals.initial_method = method;

        let outcome = execute_process(&mut rt);
        assert!(matches!(
            outcome,
            ProcessOutcome::Returned(v) if v == Value::from_int(13)
        ));
        assert_eq!(exit_code(&outcome), 0);
    }

    #[test]
    fn missing_initial_method_is_a_process_error() {
        let mut rt = special::bootstrap(MemoryConfig::default());
        let outcome = execute_process(&mut rt);
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed(RuntimeError::MissingInitialMethod)
        ));
        assert_eq!(exit_code(&outcome), codes::INITIALIZATION_FAILED);
    }

    #[test]
    fn error_families_have_distinct_exit_codes() {
        let nil = Value::NULL;
        let outcomes = [
            ProcessOutcome::UncaughtNonLocal { value: nil },
            ProcessOutcome::Failed(RuntimeError::Allocation(
                heap::AllocError::HeapExhausted { requested: 64 },
            )),
            ProcessOutcome::Failed(RuntimeError::NoDoesNotUnderstand {
                selector: String::from("foo"),
            }),
            ProcessOutcome::Failed(RuntimeError::MissingInitialMethod),
            ProcessOutcome::Failed(RuntimeError::StackOverflow),
        ];
        let mut seen = Vec::new();
        for outcome in &outcomes {
            let code = exit_code(outcome);
            assert_ne!(code, codes::OK);
            assert!(!seen.contains(&code), "exit code {code} reused");
            seen.push(code);
        }
    }
}
