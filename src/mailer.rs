//! Queue-backed transactional mail delivery
//!
//! Templates come from the `emails.<key>` configuration and are rendered
//! with simple `{placeholder}` substitution. In test mode, or when no SMTP
//! relay is configured, messages land in a [`StubMailbox`] instead.

use std::sync::Arc;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{Error, InternalError};

const DEFAULT_QUEUE_SIZE: usize = 64;

/// A basic interface to send templated email messages
#[derive(Clone, Debug)]
pub struct Mailer {
	config:     Arc<Config>,
	from:       Address,
	send_queue: mpsc::Sender<Message>,
}

/// A fake mailbox to keep track of mails sent in tests
#[derive(Default)]
pub struct StubMailbox {
	pub mailbox:     Mutex<Vec<Message>>,
	pub mail_signal: Condvar,
}

impl StubMailbox {
	/// Number of messages delivered so far
	#[must_use]
	pub fn len(&self) -> usize {
		self.mailbox.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Mailer {
	/// Create a new mailer
	///
	/// Spawns the sender task: a stub sender when test mode disables email
	/// or no SMTP relay is configured, a real SMTP sender otherwise.
	///
	/// # Errors
	/// Fails if the configured from address does not parse
	pub fn new(
		config: Arc<Config>,
		stub_mailbox: Option<Arc<StubMailbox>>,
	) -> Result<Self, Error> {
		let queue_size =
			config.mailer.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE);
		let (tx, rx) = mpsc::channel(queue_size);

		let from: Address = config.mailer.from_email.parse()?;

		if config.test_mode.no_email || config.mailer.smtp_server.is_empty() {
			let stub_mailbox = stub_mailbox.unwrap_or_default();

			tokio::spawn(Self::start_stub_sender(rx, stub_mailbox));
		} else {
			tokio::spawn(Self::start_smtp_sender(
				rx,
				from.clone(),
				config.mailer.smtp_server.clone(),
				config.mailer.smtp_password.clone(),
			));
		}

		Ok(Self { config, from, send_queue: tx })
	}

	/// Render and send the email template registered under `template_key`
	///
	/// # Errors
	/// Fails if the template is unknown, the receiver does not parse, or
	/// the mail queue was closed
	#[instrument(skip(self, context))]
	pub async fn send(
		&self,
		template_key: &str,
		to: &str,
		context: &[(&str, &str)],
	) -> Result<(), Error> {
		let Some(template) = self.config.emails.get(template_key) else {
			return Err(InternalError::StoreError(format!(
				"no email template registered under '{template_key}'"
			))
			.into());
		};

		let mut body = template.template.clone();
		let mut subject = template.subject.clone();

		for (key, value) in context {
			let placeholder = format!("{{{key}}}");
			body = body.replace(&placeholder, value);
			subject = subject.replace(&placeholder, value);
		}

		let message = self.try_build_message(to, &subject, &body)?;

		self.send_queue.send(message).await?;

		info!("queued {template_key} email for {to}");

		Ok(())
	}

	/// Try to build an email [`Message`]
	///
	/// # Errors
	/// Fails if the receiver or body cannot be parsed
	pub fn try_build_message(
		&self,
		receiver: &str,
		subject: &str,
		body: &str,
	) -> Result<Message, Error> {
		Ok(Message::builder()
			.from(Mailbox::new(None, self.from.clone()))
			.to(Mailbox::new(None, receiver.parse()?))
			.subject(subject)
			.body(body.to_string())?)
	}

	/// Start an infinitely looping stub sender task
	#[instrument(skip_all)]
	async fn start_stub_sender(
		mut rx: mpsc::Receiver<Message>,
		stub_mailbox: Arc<StubMailbox>,
	) {
		while let Some(mail) = rx.recv().await {
			{
				let mut mailbox = stub_mailbox.mailbox.lock();
				mailbox.push(mail);
				stub_mailbox.mail_signal.notify_all();
			}

			debug!(target: "[STUB_MAILER]", "delivered email to stub mailbox");
		}
	}

	/// Start an infinitely looping smtp sender task
	#[instrument(skip_all)]
	async fn start_smtp_sender(
		mut rx: mpsc::Receiver<Message>,
		address: Address,
		server: String,
		password: String,
	) {
		let transport = match SmtpTransport::starttls_relay(&server) {
			Ok(builder) => {
				builder
					.credentials(Credentials::new(
						address.to_string(),
						password,
					))
					.build()
			},
			Err(e) => {
				error!("could not build smtp transport: {e:?}");

				return;
			},
		};

		while let Some(mail) = rx.recv().await {
			match transport.send(&mail) {
				Ok(res) => info!("sent email: {res:?}"),
				Err(e) => error!("error sending email: {e:?}"),
			}
		}
	}
}
