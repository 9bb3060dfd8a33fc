use crate::{ErrorCode, Frame, FrameHandler, FrameType, Http3Error, StreamRole};

/// Enforces which frame types are legal on which stream roles.
///
/// On the control stream: the first frame must be SETTINGS, exactly one
/// SETTINGS is permitted, and DATA / HEADERS / PUSH_PROMISE / reserved types
/// are rejected. On request streams, reserved types are rejected; unknown
/// types pass through untouched.
#[derive(Default)]
pub struct ProtocolEnforcer;

impl ProtocolEnforcer {
    pub fn new() -> Self {
        Self
    }
}

impl FrameHandler for ProtocolEnforcer {
    fn interests(&self) -> Vec<FrameType> {
        FrameType::ALL.to_vec()
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        frame_seq: u64,
        role: StreamRole,
    ) -> Result<(), Http3Error> {
        let typ = frame.frame_type();

        match role {
            StreamRole::Control => {
                if frame_seq == 0 && typ != FrameType::Settings {
                    return Err(Http3Error::connection(
                        ErrorCode::H3MissingSettings,
                        "first frame on control stream must be SETTINGS",
                    ));
                }
                match typ {
                    FrameType::Settings if frame_seq > 0 => Err(Http3Error::connection(
                        ErrorCode::H3FrameUnexpected,
                        "only one SETTINGS frame is permitted",
                    )),
                    FrameType::Data | FrameType::Headers | FrameType::PushPromise => {
                        Err(Http3Error::connection(
                            ErrorCode::H3FrameUnexpected,
                            "frame not allowed on control stream",
                        ))
                    }
                    t if t.is_reserved() => Err(Http3Error::connection(
                        ErrorCode::H3FrameUnexpected,
                        "reserved frame type on control stream",
                    )),
                    _ => Ok(()),
                }
            }
            _ => {
                if typ.is_reserved() {
                    return Err(Http3Error::stream(
                        ErrorCode::H3FrameUnexpected,
                        "reserved frame type",
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteChain, FrameDispatcher};
    use std::sync::{Arc, Mutex};

    fn control_dispatcher() -> FrameDispatcher {
        let mut dispatcher = FrameDispatcher::new(10);
        dispatcher.add_handler(Arc::new(Mutex::new(ProtocolEnforcer::new())));
        dispatcher
    }

    fn run(
        dispatcher: &mut FrameDispatcher,
        role: StreamRole,
        input: &[u8],
    ) -> (Result<(), Http3Error>, u64) {
        let mut reader = ByteChain::new();
        reader.write(input);
        let mut nread = 0;
        let res = dispatcher.on_read_ready(0, role, &mut reader, &mut nread);
        (res, nread)
    }

    #[test]
    fn control_stream_first_frame_must_be_settings() {
        let mut dispatcher = control_dispatcher();
        // MAX_PUSH_ID first, then a valid SETTINGS
        let input = [0x0d, 0x01, 0x01, 0x04, 0x02, 0x01, 0x00];
        let (res, nread) = run(&mut dispatcher, StreamRole::Control, &input);
        assert_eq!(res.unwrap_err().code, ErrorCode::H3MissingSettings);
        assert_eq!(nread, 3);
    }

    #[test]
    fn control_stream_settings_first_is_ok() {
        let mut dispatcher = control_dispatcher();
        let input = [0x04, 0x02, 0x01, 0x00];
        let (res, nread) = run(&mut dispatcher, StreamRole::Control, &input);
        assert!(res.is_ok());
        assert_eq!(nread, 4);
    }

    #[test]
    fn duplicate_settings_rejected() {
        let mut dispatcher = control_dispatcher();
        let input = [
            0x04, 0x02, 0x01, 0x00, // SETTINGS
            0x04, 0x02, 0x01, 0x00, // SETTINGS again
        ];
        let (res, _) = run(&mut dispatcher, StreamRole::Control, &input);
        assert_eq!(res.unwrap_err().code, ErrorCode::H3FrameUnexpected);
    }

    #[test]
    fn reserved_frame_on_request_stream() {
        let mut dispatcher = control_dispatcher();
        let input = [0x06, 0x04, 0x11, 0x22, 0x33, 0x44];
        let (res, _) = run(&mut dispatcher, StreamRole::Request, &input);
        assert_eq!(res.unwrap_err().code, ErrorCode::H3FrameUnexpected);
    }

    #[test]
    fn data_on_control_stream_rejected() {
        let mut dispatcher = control_dispatcher();
        let input = [
            0x04, 0x02, 0x01, 0x00, // SETTINGS
            0x00, 0x01, 0xaa, // DATA
        ];
        let (res, _) = run(&mut dispatcher, StreamRole::Control, &input);
        assert_eq!(res.unwrap_err().code, ErrorCode::H3FrameUnexpected);
    }

    #[test]
    fn goaway_on_control_stream_allowed() {
        let mut dispatcher = control_dispatcher();
        let input = [
            0x04, 0x02, 0x01, 0x00, // SETTINGS
            0x07, 0x01, 0x00, // GOAWAY
        ];
        let (res, nread) = run(&mut dispatcher, StreamRole::Control, &input);
        assert!(res.is_ok());
        assert_eq!(nread, 7);
    }

    #[test]
    fn unknown_frame_on_request_stream_skipped() {
        let mut dispatcher = control_dispatcher();
        let input = [0x21, 0x02, 0xaa, 0xbb];
        let (res, nread) = run(&mut dispatcher, StreamRole::Request, &input);
        assert!(res.is_ok());
        assert_eq!(nread, 4);
    }
}
