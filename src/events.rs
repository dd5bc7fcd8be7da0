//! Lifecycle event fan-out

use tokio::sync::broadcast;

/// Everything the core announces to the rest of the application
///
/// Subscribers observe; they can never raise back into the core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthEvent {
	Signup { user_id: String, provider: String },
	Login { user_id: String, provider: String },
	Refresh { user_id: String, session: String },
	Logout { user_id: String },
	LogoutAll { user_id: String },
	PasswordReset { user_id: String },
	PasswordChange { user_id: String },
	ForgotPassword { user_id: String },
	EmailVerified { user_id: String },
	EmailChanged { user_id: String },
	PhoneChanged { user_id: String },
	UserDbAdded { user_id: String, db_name: String },
	UserDbRemoved { user_id: String, db_name: String },
}

/// Broadcast bus carrying [`AuthEvent`]s to any number of subscribers
#[derive(Clone, Debug)]
pub struct EventBus {
	tx: broadcast::Sender<AuthEvent>,
}

impl EventBus {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);

		Self { tx }
	}

	/// Subscribe to all future events
	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
		self.tx.subscribe()
	}

	/// Emit an event; a missing or lagging subscriber never fails the core
	pub fn emit(&self, event: AuthEvent) {
		debug!("emitting {event:?}");

		let _ = self.tx.send(event);
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(64)
	}
}
