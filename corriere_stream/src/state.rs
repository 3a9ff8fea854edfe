// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

/// Which side of the stream this endpoint plays.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Client,
    Server,
}

/// Lifecycle states of a stream.
///
/// `HalfClosed` exists in the protocol taxonomy but neither role's
/// transition table reaches it: the client folds that situation into
/// `LocalClosed`, the server into `RemoteClosed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    Init,
    Open,
    LocalClosed,
    RemoteClosed,
    HalfClosed,
    Closed,
}

/// Everything that can happen to a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamAction {
    SendInit,
    SendData,
    SendFeedback,
    SendClose,
    HandleInit,
    HandleData,
    HandleFeedback,
    HandleClose,
    HandleReset,
}

/// Reports whether `action` is permitted for `role` in `state`.
///
/// Any (state, action) pair not listed here is a protocol violation: the
/// stream emits RESET, moves to `Closed` and surfaces an error.
pub fn permitted(role: StreamRole, state: StreamState, action: StreamAction) -> bool {
    use StreamAction::*;
    use StreamState::*;

    // RESET terminates from any state; a CLOSE seen in Closed is a no-op
    // handled before the table is consulted.
    if action == HandleReset {
        return true;
    }

    match role {
        StreamRole::Client => match action {
            SendInit => state == Idle,
            HandleInit => state == Init,
            SendData => state == Open,
            HandleData => state == Open || state == LocalClosed,
            SendFeedback => state == Open || state == LocalClosed,
            HandleFeedback => state == Open || state == LocalClosed || state == RemoteClosed,
            SendClose => state == Open,
            HandleClose => state == Open || state == LocalClosed,
            HandleReset => true,
        },
        StreamRole::Server => match action {
            HandleInit => state == Idle,
            SendInit => state == Init,
            HandleData => state == Open,
            SendData => state == Open || state == RemoteClosed,
            SendFeedback => state == Open,
            HandleFeedback => state == Open || state == RemoteClosed,
            HandleClose => state == Open,
            SendClose => state == Open || state == RemoteClosed,
            HandleReset => true,
        },
    }
}
