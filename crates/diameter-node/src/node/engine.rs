//! The per-connection protocol state machine: capabilities exchange,
//! device watchdog, disconnect handling, election, loop detection and
//! application filtering.
//!
//! Transport drivers feed decoded frames into [`NodeInner::handle_message`]
//! and poll [`NodeInner::next_timeout`] / [`NodeInner::run_timers`] from
//! their event loops. A `false` / close verdict tells the driver to tear
//! the connection down.

use crate::config::Capability;
use crate::config::Peer;
use crate::node::connection::Close;
use crate::node::connection::ConnectionInfo;
use crate::node::connection::ConnectionKey;
use crate::node::connection::ConnectionState;
use crate::node::registry::Registry;
use crate::node::timers::TimerAction;
use crate::node::NodeInner;
use diameter_codec::Avp;
use diameter_codec::Message;
use diameter_codec::APP_COMMON;
use diameter_codec::AVP_ACCT_APPLICATION_ID;
use diameter_codec::AVP_AUTH_APPLICATION_ID;
use diameter_codec::AVP_DISCONNECT_CAUSE;
use diameter_codec::AVP_FAILED_AVP;
use diameter_codec::AVP_FIRMWARE_REVISION;
use diameter_codec::AVP_HOST_IP_ADDRESS;
use diameter_codec::AVP_ORIGIN_HOST;
use diameter_codec::AVP_ORIGIN_REALM;
use diameter_codec::AVP_ORIGIN_STATE_ID;
use diameter_codec::AVP_PRODUCT_NAME;
use diameter_codec::AVP_RESULT_CODE;
use diameter_codec::AVP_ROUTE_RECORD;
use diameter_codec::AVP_SUPPORTED_VENDOR_ID;
use diameter_codec::AVP_VENDOR_ID;
use diameter_codec::AVP_VENDOR_SPECIFIC_APPLICATION_ID;
use diameter_codec::CMD_CAPABILITIES_EXCHANGE;
use diameter_codec::CMD_DEVICE_WATCHDOG;
use diameter_codec::CMD_DISCONNECT_PEER;
use diameter_codec::DISCONNECT_CAUSE_BUSY;
use diameter_codec::RESULT_APPLICATION_UNSUPPORTED;
use diameter_codec::RESULT_ELECTION_LOST;
use diameter_codec::RESULT_INVALID_AVP_LENGTH;
use diameter_codec::RESULT_INVALID_AVP_VALUE;
use diameter_codec::RESULT_LOOP_DETECTED;
use diameter_codec::RESULT_MISSING_AVP;
use diameter_codec::RESULT_NO_COMMON_APPLICATION;
use diameter_codec::RESULT_SUCCESS;
use diameter_codec::RESULT_UNABLE_TO_DELIVER;
use tokio::time::Instant;

/// 3GPP's vendor id. CERs from 3GPP equipment advertise applications as
/// vendor-specific while the actual traffic carries plain
/// Auth-Application-Id AVPs, so the application filter checks both.
pub const VENDOR_3GPP: u32 = 10415;

/// What the driver loop should do after a timer poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerVerdict {
    Keep,
    CloseFlush,
    CloseReset,
}

/// Work that must happen after the registry lock is released: listener
/// callbacks and dispatch run external code and may re-enter the node.
enum PostAction {
    Up(ConnectionInfo),
    Dispatch {
        message: Message,
        /// Present for requests: the prepared answer used for
        /// UNABLE_TO_DELIVER when the dispatcher declines.
        answer_template: Option<Message>,
    },
}

impl NodeInner {
    /// Routes one inbound frame. Returns `false` when the driver must
    /// close the connection.
    pub(crate) fn handle_message(&self, message: Message, key: ConnectionKey) -> bool {
        let now = Instant::now();
        let mut post = Vec::new();
        let keep = {
            let mut reg = self.registry.lock();
            let Some(conn) = reg.get_mut(key) else {
                return false;
            };
            conn.timers.record_activity(now);
            let state = conn.state;
            let header = message.header;
            match state {
                ConnectionState::Connecting | ConnectionState::Closed => false,
                ConnectionState::Tls => {
                    tracing::warn!(%key, "Frame received in the unsupported TLS state");
                    false
                }
                ConnectionState::ConnectedIn => {
                    if message.is_request()
                        && header.code == CMD_CAPABILITIES_EXCHANGE
                        && header.application_id == APP_COMMON
                    {
                        self.handle_cer(&mut reg, key, &message, now, &mut post)
                    } else {
                        tracing::warn!(
                            %key,
                            code = header.code,
                            "Expected a CER on the inbound connection"
                        );
                        false
                    }
                }
                ConnectionState::ConnectedOut => {
                    if !message.is_request()
                        && header.code == CMD_CAPABILITIES_EXCHANGE
                        && header.application_id == APP_COMMON
                    {
                        self.handle_cea(&mut reg, key, &message, now, &mut post)
                    } else {
                        tracing::warn!(
                            %key,
                            code = header.code,
                            "Expected a CEA on the outbound connection"
                        );
                        false
                    }
                }
                ConnectionState::Ready | ConnectionState::Closing => match header.code {
                    CMD_CAPABILITIES_EXCHANGE => {
                        tracing::warn!(%key, "Capabilities exchange on an open connection");
                        false
                    }
                    CMD_DEVICE_WATCHDOG => {
                        let conn = reg.get_mut(key).expect("borrow re-acquired");
                        if message.is_request() {
                            let mut answer = Message::answer(&message);
                            self.set_result(&mut answer, RESULT_SUCCESS);
                            self.add_origin(&mut answer);
                            answer.add(Avp::new_u32(AVP_ORIGIN_STATE_ID, self.state.state_id()));
                            conn.push_frame(answer.encode());
                        } else {
                            conn.timers.record_dwa(now);
                        }
                        true
                    }
                    CMD_DISCONNECT_PEER => {
                        let conn = reg.get_mut(key).expect("borrow re-acquired");
                        if message.is_request() {
                            let cause = message
                                .find_avp(AVP_DISCONNECT_CAUSE)
                                .and_then(|avp| avp.as_u32().ok());
                            tracing::info!(%key, ?cause, "Peer requested disconnect");
                            let mut answer = Message::answer(&message);
                            self.set_result(&mut answer, RESULT_SUCCESS);
                            self.add_origin(&mut answer);
                            conn.push_frame(answer.encode());
                        } else {
                            tracing::debug!(%key, "DPA received");
                        }
                        false
                    }
                    _ => self.handle_app_message(&mut reg, key, message, now, &mut post),
                },
            }
        };
        self.run_post_actions(key, post);
        keep
    }

    fn handle_app_message(
        &self,
        reg: &mut Registry,
        key: ConnectionKey,
        message: Message,
        now: Instant,
        post: &mut Vec<PostAction>,
    ) -> bool {
        let conn = reg.get_mut(key).expect("caller checked the key");
        conn.timers.record_real_activity(now);
        if message.is_request() {
            // RFC 3588 §6.1.3: a request that already passed through us
            // is looping.
            let looping = message.find_avps(AVP_ROUTE_RECORD).any(|avp| {
                avp.as_str()
                    .is_ok_and(|host| host.eq_ignore_ascii_case(&self.settings.host_id))
            });
            if looping {
                tracing::warn!(%key, code = message.header.code, "Loop detected");
                let mut answer = Message::answer(&message);
                self.set_result(&mut answer, RESULT_LOOP_DETECTED);
                self.add_origin(&mut answer);
                conn.push_frame(answer.encode());
                return true;
            }
            let empty = Capability::default();
            let capabilities = conn.peer_capabilities.as_ref().unwrap_or(&empty);
            if let Err(result_code) = is_allowed_application(&message, capabilities) {
                tracing::warn!(
                    %key,
                    code = message.header.code,
                    result_code,
                    "Rejecting request for unsupported application"
                );
                let mut answer = Message::answer(&message);
                self.set_result(&mut answer, result_code);
                self.add_origin(&mut answer);
                conn.push_frame(answer.encode());
                return true;
            }
            let answer_template = Some(Message::answer(&message));
            post.push(PostAction::Dispatch {
                message,
                answer_template,
            });
        } else {
            post.push(PostAction::Dispatch {
                message,
                answer_template: None,
            });
        }
        true
    }

    fn handle_cer(
        &self,
        reg: &mut Registry,
        key: ConnectionKey,
        message: &Message,
        now: Instant,
        post: &mut Vec<PostAction>,
    ) -> bool {
        let origin_host = match message.find_avp(AVP_ORIGIN_HOST) {
            None => {
                tracing::warn!(%key, "CER without Origin-Host");
                let mut answer = Message::answer(message);
                self.set_result(&mut answer, RESULT_MISSING_AVP);
                self.add_origin(&mut answer);
                answer.add(Avp::new_grouped(
                    AVP_FAILED_AVP,
                    &[Avp::new_string(AVP_ORIGIN_HOST, "")],
                ));
                self.push_to(reg, key, answer);
                return false;
            }
            Some(avp) => match avp.as_str() {
                Ok(host) => host.to_string(),
                Err(_) => {
                    tracing::warn!(%key, "CER with a malformed Origin-Host");
                    let mut answer = Message::answer(message);
                    self.set_result(&mut answer, RESULT_INVALID_AVP_VALUE);
                    self.add_origin(&mut answer);
                    self.push_to(reg, key, answer);
                    return false;
                }
            },
        };

        if let Err(result_code) = self.validator.authenticate_node(&origin_host, message) {
            tracing::warn!(%key, %origin_host, result_code, "Validator rejected peer");
            let mut answer = Message::answer(message);
            self.set_result(&mut answer, result_code);
            self.add_origin(&mut answer);
            self.push_to(reg, key, answer);
            return false;
        }

        // Election, RFC 3588 §5.6.4: identities compare as unsigned
        // byte strings.
        let ours = self.settings.host_id.as_bytes();
        let theirs = origin_host.as_bytes();
        if ours == theirs {
            tracing::warn!(%key, %origin_host, "CER from our own identity; dropping suspected self-connection");
            return false;
        }
        if let Some(existing) = reg.find_ready_by_host_id(&origin_host, key) {
            if ours > theirs {
                tracing::info!(
                    %key,
                    %origin_host,
                    %existing,
                    "Election won; replacing the established connection"
                );
                let existing_conn = reg.get_mut(existing).expect("key just looked up");
                existing_conn.state = ConnectionState::Closing;
                existing_conn.push_close(Close::Flush);
            } else {
                tracing::info!(%key, %origin_host, "Election lost; rejecting duplicate CER");
                let mut answer = Message::answer(message);
                self.set_result(&mut answer, RESULT_ELECTION_LOST);
                self.add_origin(&mut answer);
                self.push_to(reg, key, answer);
                return false;
            }
        }

        let reported = Capability::from_message(message);
        let negotiated =
            self.validator
                .authorize_node(&origin_host, &self.settings.capabilities, &reported);
        if negotiated.is_empty() {
            tracing::warn!(%key, %origin_host, "No application in common with peer");
            let mut answer = Message::answer(message);
            self.set_result(&mut answer, RESULT_NO_COMMON_APPLICATION);
            self.add_origin(&mut answer);
            self.push_to(reg, key, answer);
            return false;
        }

        let conn = reg.get_mut(key).expect("caller checked the key");
        let peer = Peer {
            host: origin_host.clone(),
            port: conn.remote_address.map(|addr| addr.port()).unwrap_or(0),
            transport: conn.transport,
        };
        conn.host_id = Some(origin_host.clone());
        conn.peer = Some(peer);
        conn.peer_capabilities = Some(negotiated);

        let mut answer = Message::answer(message);
        self.set_result(&mut answer, RESULT_SUCCESS);
        let local_addresses = conn.local_addresses.clone();
        self.fill_identity(&mut answer, &local_addresses);
        conn.push_frame(answer.encode());
        conn.state = ConnectionState::Ready;
        conn.timers.enter_ready(now);
        conn.announced_up = true;
        tracing::info!(%key, %origin_host, "Peer connection ready (inbound)");
        post.push(PostAction::Up(conn.info()));
        true
    }

    fn handle_cea(
        &self,
        reg: &mut Registry,
        key: ConnectionKey,
        message: &Message,
        now: Instant,
        post: &mut Vec<PostAction>,
    ) -> bool {
        let Some(result_code) = message
            .find_avp(AVP_RESULT_CODE)
            .and_then(|avp| avp.as_u32().ok())
        else {
            tracing::warn!(%key, "CEA without a usable Result-Code");
            return false;
        };
        if result_code != RESULT_SUCCESS {
            tracing::warn!(%key, result_code, "Peer rejected our CER");
            return false;
        }
        let origin_host = match message.find_avp(AVP_ORIGIN_HOST).map(|avp| avp.as_str()) {
            Some(Ok(host)) => host.to_string(),
            _ => {
                tracing::warn!(%key, "CEA without a usable Origin-Host");
                return false;
            }
        };
        if self.settings.host_id.as_bytes() == origin_host.as_bytes() {
            tracing::warn!(%key, %origin_host, "CEA from our own identity; dropping suspected self-connection");
            return false;
        }
        if let Some(existing) = reg.find_ready_by_host_id(&origin_host, key) {
            tracing::warn!(
                %key,
                %origin_host,
                %existing,
                "Already have an established connection to this peer; dropping the new one"
            );
            return false;
        }
        let reported = Capability::from_message(message);
        let negotiated =
            self.validator
                .authorize_node(&origin_host, &self.settings.capabilities, &reported);
        if negotiated.is_empty() {
            tracing::warn!(%key, %origin_host, "No application in common with peer");
            return false;
        }
        let conn = reg.get_mut(key).expect("caller checked the key");
        // The advertised identity goes into host_id; the peer keeps the
        // name it was dialed with, so the persistent-peer set and the
        // idempotency check keep matching it.
        conn.host_id = Some(origin_host.clone());
        conn.peer_capabilities = Some(negotiated);
        conn.state = ConnectionState::Ready;
        conn.timers.enter_ready(now);
        conn.announced_up = true;
        tracing::info!(%key, %origin_host, "Peer connection ready (outbound)");
        post.push(PostAction::Up(conn.info()));
        true
    }

    /// Builds and queues our CER on a freshly connected outbound socket.
    pub(crate) fn send_cer(&self, key: ConnectionKey) {
        let mut reg = self.registry.lock();
        let Some(conn) = reg.get_mut(key) else {
            return;
        };
        let mut cer = Message::request(CMD_CAPABILITIES_EXCHANGE, APP_COMMON);
        cer.header.hop_by_hop_id = conn.next_hop_by_hop();
        cer.header.end_to_end_id = self.state.next_end_to_end();
        let local_addresses = conn.local_addresses.clone();
        self.fill_identity(&mut cer, &local_addresses);
        tracing::debug!(%key, "Sending CER");
        conn.push_frame(cer.encode());
    }

    /// Sends a DPR and leaves the connection draining in `Closing`.
    pub(crate) fn initiate_connection_close(
        &self,
        reg: &mut Registry,
        key: ConnectionKey,
        cause: u32,
    ) {
        let Some(conn) = reg.get_mut(key) else {
            return;
        };
        if conn.state != ConnectionState::Ready {
            return;
        }
        let mut dpr = Message::request(CMD_DISCONNECT_PEER, APP_COMMON);
        dpr.header.hop_by_hop_id = conn.next_hop_by_hop();
        dpr.header.end_to_end_id = self.state.next_end_to_end();
        self.add_origin(&mut dpr);
        dpr.add(Avp::new_u32(AVP_DISCONNECT_CAUSE, cause));
        tracing::info!(key = %conn.key, cause, "Sending DPR");
        conn.push_frame(dpr.encode());
        conn.state = ConnectionState::Closing;
    }

    /// The next instant the driver loop must wake up for, or `None` when
    /// the connection is already gone.
    pub(crate) fn next_timeout(&self, key: ConnectionKey) -> Option<Instant> {
        let reg = self.registry.lock();
        let conn = reg.get(key)?;
        let mut deadline = conn.timers.next_timeout(conn.state == ConnectionState::Ready);
        if let Some(stop) = reg.shutdown_deadline {
            deadline = deadline.min(stop);
        }
        Some(deadline)
    }

    /// Runs expired timers for one connection.
    pub(crate) fn run_timers(&self, key: ConnectionKey) -> TimerVerdict {
        let now = Instant::now();
        let mut reg = self.registry.lock();
        if reg
            .shutdown_deadline
            .is_some_and(|deadline| now >= deadline)
        {
            return TimerVerdict::CloseReset;
        }
        let Some(conn) = reg.get_mut(key) else {
            return TimerVerdict::CloseReset;
        };
        let ready = conn.state == ConnectionState::Ready;
        match conn.timers.action(ready, now) {
            TimerAction::None => TimerVerdict::Keep,
            TimerAction::SendDwr => {
                let mut dwr = Message::request(CMD_DEVICE_WATCHDOG, APP_COMMON);
                dwr.header.hop_by_hop_id = conn.next_hop_by_hop();
                dwr.header.end_to_end_id = self.state.next_end_to_end();
                self.add_origin(&mut dwr);
                dwr.add(Avp::new_u32(AVP_ORIGIN_STATE_ID, self.state.state_id()));
                tracing::debug!(%key, "Sending DWR");
                conn.push_frame(dwr.encode());
                conn.timers.record_dwr_sent(now);
                TimerVerdict::Keep
            }
            TimerAction::DisconnectNoCer => {
                tracing::warn!(%key, state = %conn.state, "No capabilities exchange within the watchdog interval");
                TimerVerdict::CloseReset
            }
            TimerAction::DisconnectNoDw => {
                tracing::warn!(%key, "Watchdog went unanswered; peer presumed dead");
                TimerVerdict::CloseReset
            }
            TimerAction::DisconnectIdle => {
                tracing::info!(%key, "Disconnecting idle peer");
                self.initiate_connection_close(&mut reg, key, DISCONNECT_CAUSE_BUSY);
                TimerVerdict::Keep
            }
        }
    }

    /// Final close bookkeeping, idempotent: the first call removes the
    /// connection from the registry, then notifies the listener; later
    /// calls find nothing.
    pub(crate) fn connection_closed(&self, key: ConnectionKey) {
        let info = {
            let mut reg = self.registry.lock();
            reg.remove(key).and_then(|mut conn| {
                conn.state = ConnectionState::Closed;
                conn.announced_up.then(|| conn.info())
            })
        };
        if let Some(info) = info {
            tracing::info!(%key, host_id = ?info.host_id, "Peer connection closed");
            self.listener.connection_down(&info);
        }
        // Waiters re-check their predicates; the reconnect worker may
        // want to re-establish a persistent peer. The extra notify_one
        // leaves a permit behind for a worker that was mid-scan when
        // this close landed.
        self.conn_available.notify_waiters();
        self.registry_notify.notify_waiters();
        self.registry_notify.notify_one();
    }

    fn run_post_actions(&self, key: ConnectionKey, post: Vec<PostAction>) {
        for action in post {
            match action {
                PostAction::Up(info) => {
                    self.listener.connection_up(&info);
                    self.conn_available.notify_waiters();
                }
                PostAction::Dispatch {
                    message,
                    answer_template,
                } => {
                    let code = message.header.code;
                    if !self.dispatcher.dispatch(message, key) {
                        if let Some(mut answer) = answer_template {
                            tracing::debug!(%key, code, "Dispatcher declined request; answering UNABLE_TO_DELIVER");
                            self.set_result(&mut answer, RESULT_UNABLE_TO_DELIVER);
                            self.add_origin(&mut answer);
                            let mut reg = self.registry.lock();
                            if let Some(conn) = reg.get_mut(key) {
                                conn.push_frame(answer.encode());
                            }
                        }
                    }
                }
            }
        }
    }

    fn push_to(&self, reg: &mut Registry, key: ConnectionKey, answer: Message) {
        if let Some(conn) = reg.get(key) {
            conn.push_frame(answer.encode());
        }
    }

    /// Adds Result-Code and flips the E-bit for protocol errors, which
    /// RFC 3588 defines as the 3xxx range.
    fn set_result(&self, answer: &mut Message, result_code: u32) {
        answer.add(Avp::new_u32(AVP_RESULT_CODE, result_code));
        if (3000..=3999).contains(&result_code) {
            answer.header.set_error(true);
        }
    }

    fn add_origin(&self, message: &mut Message) {
        message.add(Avp::new_string(AVP_ORIGIN_HOST, &self.settings.host_id));
        message.add(Avp::new_string(AVP_ORIGIN_REALM, &self.settings.realm));
    }

    /// The full CER/CEA identity-and-capability block.
    fn fill_identity(&self, message: &mut Message, local_addresses: &[std::net::IpAddr]) {
        self.add_origin(message);
        for addr in local_addresses {
            message.add(Avp::new_address(AVP_HOST_IP_ADDRESS, *addr));
        }
        message.add(Avp::new_u32(AVP_VENDOR_ID, self.settings.vendor_id));
        // Product-Name and Firmware-Revision are informational and MUST
        // NOT carry the M-bit.
        let mut product = Avp::new_string(AVP_PRODUCT_NAME, &self.settings.product_name);
        product.set_mandatory(false);
        message.add(product);
        message.add(Avp::new_u32(AVP_ORIGIN_STATE_ID, self.state.state_id()));
        let capabilities = &self.settings.capabilities;
        for vendor in &capabilities.supported_vendors {
            message.add(Avp::new_u32(AVP_SUPPORTED_VENDOR_ID, *vendor));
        }
        for app in &capabilities.auth_apps {
            message.add(Avp::new_u32(AVP_AUTH_APPLICATION_ID, *app));
        }
        for app in &capabilities.acct_apps {
            message.add(Avp::new_u32(AVP_ACCT_APPLICATION_ID, *app));
        }
        for (vendor, app) in &capabilities.vendor_auth_apps {
            message.add(Avp::new_grouped(
                AVP_VENDOR_SPECIFIC_APPLICATION_ID,
                &[
                    Avp::new_u32(AVP_VENDOR_ID, *vendor),
                    Avp::new_u32(AVP_AUTH_APPLICATION_ID, *app),
                ],
            ));
        }
        for (vendor, app) in &capabilities.vendor_acct_apps {
            message.add(Avp::new_grouped(
                AVP_VENDOR_SPECIFIC_APPLICATION_ID,
                &[
                    Avp::new_u32(AVP_VENDOR_ID, *vendor),
                    Avp::new_u32(AVP_ACCT_APPLICATION_ID, *app),
                ],
            ));
        }
        if self.settings.firmware_revision != 0 {
            let mut firmware =
                Avp::new_u32(AVP_FIRMWARE_REVISION, self.settings.firmware_revision);
            firmware.set_mandatory(false);
            message.add(firmware);
        }
    }
}

/// Checks the application identifier AVPs of a request against the
/// negotiated peer capabilities. `Err` carries the Result-Code for the
/// rejecting answer.
fn is_allowed_application(message: &Message, capabilities: &Capability) -> Result<(), u32> {
    if let Some(avp) = message.find_avp(AVP_AUTH_APPLICATION_ID) {
        let app = avp.as_u32().map_err(|_| RESULT_INVALID_AVP_LENGTH)?;
        if capabilities.has_auth_app(app) || capabilities.has_vendor_auth_app(VENDOR_3GPP, app) {
            return Ok(());
        }
        return Err(RESULT_APPLICATION_UNSUPPORTED);
    }
    if let Some(avp) = message.find_avp(AVP_ACCT_APPLICATION_ID) {
        let app = avp.as_u32().map_err(|_| RESULT_INVALID_AVP_LENGTH)?;
        if capabilities.has_acct_app(app) {
            return Ok(());
        }
        return Err(RESULT_APPLICATION_UNSUPPORTED);
    }
    if let Some(avp) = message.find_avp(AVP_VENDOR_SPECIFIC_APPLICATION_ID) {
        let group = avp.as_grouped().map_err(|_| RESULT_INVALID_AVP_LENGTH)?;
        let Some(vendor) = group.iter().find(|avp| avp.code == AVP_VENDOR_ID) else {
            return Err(RESULT_MISSING_AVP);
        };
        let vendor = vendor.as_u32().map_err(|_| RESULT_INVALID_AVP_VALUE)?;
        if let Some(auth) = group.iter().find(|avp| avp.code == AVP_AUTH_APPLICATION_ID) {
            let app = auth.as_u32().map_err(|_| RESULT_INVALID_AVP_LENGTH)?;
            if capabilities.has_vendor_auth_app(vendor, app) {
                return Ok(());
            }
            return Err(RESULT_APPLICATION_UNSUPPORTED);
        }
        if let Some(acct) = group.iter().find(|avp| avp.code == AVP_ACCT_APPLICATION_ID) {
            let app = acct.as_u32().map_err(|_| RESULT_INVALID_AVP_LENGTH)?;
            if capabilities.has_vendor_acct_app(vendor, app) {
                return Ok(());
            }
            return Err(RESULT_APPLICATION_UNSUPPORTED);
        }
        return Err(RESULT_MISSING_AVP);
    }
    Err(RESULT_APPLICATION_UNSUPPORTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn capabilities() -> Capability {
        Capability {
            auth_apps: HashSet::from([4]),
            vendor_auth_apps: HashSet::from([(VENDOR_3GPP, 16777251)]),
            ..Capability::default()
        }
    }

    fn request_with(avp: Avp) -> Message {
        let mut message = Message::request(1000, 4);
        message.add(avp);
        message
    }

    #[test]
    fn plain_auth_app_is_allowed() {
        let message = request_with(Avp::new_u32(AVP_AUTH_APPLICATION_ID, 4));

        assert_eq!(is_allowed_application(&message, &capabilities()), Ok(()));
    }

    #[test]
    fn three_gpp_cross_check_accepts_plain_auth_app() {
        // The peer advertised (10415, 16777251) as vendor-specific; the
        // request carries it as a plain Auth-Application-Id.
        let message = request_with(Avp::new_u32(AVP_AUTH_APPLICATION_ID, 16777251));

        assert_eq!(is_allowed_application(&message, &capabilities()), Ok(()));
    }

    #[test]
    fn unknown_app_is_rejected() {
        let message = request_with(Avp::new_u32(AVP_AUTH_APPLICATION_ID, 99));

        assert_eq!(
            is_allowed_application(&message, &capabilities()),
            Err(RESULT_APPLICATION_UNSUPPORTED)
        );
    }

    #[test]
    fn missing_application_id_is_rejected() {
        let message = Message::request(1000, 4);

        assert_eq!(
            is_allowed_application(&message, &capabilities()),
            Err(RESULT_APPLICATION_UNSUPPORTED)
        );
    }

    #[test]
    fn malformed_width_is_rejected() {
        let message = request_with(Avp::new_string(AVP_AUTH_APPLICATION_ID, "not a number"));

        assert_eq!(
            is_allowed_application(&message, &capabilities()),
            Err(RESULT_INVALID_AVP_LENGTH)
        );
    }

    #[test]
    fn vendor_specific_requires_vendor_id() {
        let group = Avp::new_grouped(
            AVP_VENDOR_SPECIFIC_APPLICATION_ID,
            &[Avp::new_u32(AVP_AUTH_APPLICATION_ID, 16777251)],
        );

        assert_eq!(
            is_allowed_application(&request_with(group), &capabilities()),
            Err(RESULT_MISSING_AVP)
        );
    }

    #[test]
    fn vendor_specific_auth_app_is_allowed() {
        let group = Avp::new_grouped(
            AVP_VENDOR_SPECIFIC_APPLICATION_ID,
            &[
                Avp::new_u32(AVP_VENDOR_ID, VENDOR_3GPP),
                Avp::new_u32(AVP_AUTH_APPLICATION_ID, 16777251),
            ],
        );

        assert_eq!(is_allowed_application(&request_with(group), &capabilities()), Ok(()));
    }

    #[test]
    fn vendor_specific_without_app_id_is_rejected() {
        let group = Avp::new_grouped(
            AVP_VENDOR_SPECIFIC_APPLICATION_ID,
            &[Avp::new_u32(AVP_VENDOR_ID, VENDOR_3GPP)],
        );

        assert_eq!(
            is_allowed_application(&request_with(group), &capabilities()),
            Err(RESULT_MISSING_AVP)
        );
    }
}
