use std::fmt;

/// Fatal initialization failures, classified so the launcher can guide the
/// user instead of dumping a backtrace.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InitError {
	#[error("{0}")]
	Config(ActionableError),
	#[error("{0}")]
	PortInUse(ActionableError),
	#[error("{0}")]
	DatabaseLocked(ActionableError),
	#[error("{0}")]
	CaCorrupt(ActionableError),
	#[error("{0}")]
	CaPermission(ActionableError),
	#[error("{0}")]
	Io(ActionableError),
}

impl InitError {
	pub fn actionable(&self) -> &ActionableError {
		match self {
			InitError::Config(a)
			| InitError::PortInUse(a)
			| InitError::DatabaseLocked(a)
			| InitError::CaCorrupt(a)
			| InitError::CaPermission(a)
			| InitError::Io(a) => a,
		}
	}

	/// All init failures exit with 1; normal shutdown exits 0.
	pub fn exit_code(&self) -> i32 {
		1
	}
}

/// A one-line what/cause/fix triple for human consumption.
#[derive(Debug, Clone)]
pub struct ActionableError {
	pub what: String,
	pub cause: String,
	pub fix: String,
}

impl ActionableError {
	pub fn new(
		what: impl Into<String>,
		cause: impl Into<String>,
		fix: impl Into<String>,
	) -> ActionableError {
		ActionableError {
			what: what.into(),
			cause: cause.into(),
			fix: fix.into(),
		}
	}
}

impl fmt::Display for ActionableError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (cause: {}; fix: {})", self.what, self.cause, self.fix)
	}
}

impl std::error::Error for ActionableError {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn actionable_renders_one_line() {
		let e = InitError::PortInUse(ActionableError::new(
			"cannot bind 127.0.0.1:9090",
			"address already in use",
			"stop the other process or change proxy.listen",
		));
		let s = e.to_string();
		assert!(s.contains("cannot bind"));
		assert!(s.contains("fix:"));
		assert!(!s.contains('\n'));
		assert_eq!(e.exit_code(), 1);
	}
}
