//! Unit tests for frame encoding.

use rstest::rstest;

use super::*;

fn command() -> Frame {
    Frame::Command {
        token: "12".to_owned(),
        service: "Diag".to_owned(),
        name: "echo".to_owned(),
        data: b"\"Hello\"\0".to_vec(),
    }
}

#[rstest]
fn command_layout_matches_the_wire_format() {
    assert_eq!(command().encode(), b"C\x0012\0Diag\0echo\0\"Hello\"\0".to_vec());
}

#[rstest]
fn flow_layout_matches_the_wire_format() {
    assert_eq!(Frame::Flow { level: -5 }.encode(), b"F\0-5\0".to_vec());
}

#[rstest]
#[case(command())]
#[case(Frame::Progress { token: "3".to_owned(), data: b"1\0".to_vec() })]
#[case(Frame::Result { token: "3".to_owned(), data: Vec::new() })]
#[case(Frame::NotFound { token: "9".to_owned() })]
#[case(Frame::Event { service: "Locator".to_owned(), name: "Hello".to_owned(), data: b"[\"Diag\"]\0".to_vec() })]
#[case(Frame::Flow { level: 42 })]
fn frames_decode_to_what_was_encoded(#[case] frame: Frame) {
    assert_eq!(Frame::decode(&frame.encode()), Ok(frame));
}

#[rstest]
fn accessors_expose_header_fields() {
    let frame = command();
    assert_eq!(frame.message_type(), MessageType::Command);
    assert_eq!(frame.token(), Some("12"));
    assert_eq!(frame.service(), Some("Diag"));
    assert_eq!(frame.name(), Some("echo"));
    assert_eq!(Frame::Flow { level: 1 }.token(), None);
}

#[rstest]
#[case(b"".as_slice(), FrameError::Empty)]
#[case(b"X\0".as_slice(), FrameError::UnknownType(b'X'))]
#[case(b"C".as_slice(), FrameError::MissingField { message_type: MessageType::Command, field: "separator" })]
#[case(b"C\x001\0Diag\0echo".as_slice(), FrameError::MissingField { message_type: MessageType::Command, field: "name" })]
#[case(b"R\0".as_slice(), FrameError::MissingField { message_type: MessageType::Result, field: "token" })]
#[case(b"E\0\xff\0x\0".as_slice(), FrameError::InvalidField { message_type: MessageType::Event, field: "service" })]
#[case(b"F\0high\0".as_slice(), FrameError::InvalidLevel("high".to_owned()))]
fn malformed_frames_are_rejected(#[case] body: &[u8], #[case] expected: FrameError) {
    assert_eq!(Frame::decode(body), Err(expected));
}

#[rstest]
fn message_type_tags_round_trip() {
    for tag in *b"CPRNEF" {
        let message_type = MessageType::from_byte(tag).expect("known tag");
        assert_eq!(message_type.as_byte(), tag);
    }
    assert_eq!(MessageType::from_byte(b'Z'), None);
}
