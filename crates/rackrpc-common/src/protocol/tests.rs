//! Tests for the protocol module
//!
//! These tests verify frame tagging, request id generation and the
//! mapping between responses and caller-facing results.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_request_creation() {
        let req = Request::new(commands::IDENTIFY, json!({}));
        assert_eq!(req.command, "Identify");
        assert!(req.args.is_empty());
    }

    #[test]
    fn test_request_non_object_args_become_empty() {
        let req = Request::new("PowerOn", json!([1, 2, 3]));
        assert!(req.args.is_empty());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| Request::new("Identify", json!({})).id)
            .collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_frame_is_tagged() {
        let frame = Frame::from(Request::new("PowerOff", json!({"system_id": "abc"})));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["command"], "PowerOff");
        assert_eq!(value["args"]["system_id"], "abc");
    }

    #[test]
    fn test_response_frame_omits_absent_fields() {
        let frame = Frame::from(Response::success(9, json!({"ident": "region1"})));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "response");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_request_without_args_decodes() {
        let frame: Frame =
            serde_json::from_str(r#"{"type":"request","id":3,"command":"Identify"}"#).unwrap();
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.id, 3);
                assert!(req.args.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_into_result() {
        let resp = Response::error(1, RemoteError::unhandled_command("PowerOn"));
        match resp.into_result() {
            Err(RpcError::Remote(err)) => assert_eq!(err.code, "UnhandledCommand"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_empty_success_is_empty_object() {
        let resp = Response {
            id: 1,
            result: None,
            error: None,
        };
        assert_eq!(resp.into_result().unwrap(), json!({}));
    }

    #[test]
    fn test_identify_result_schema() {
        let parsed: commands::IdentifyResult =
            serde_json::from_value(json!({"ident": "region1"})).unwrap();
        assert_eq!(parsed.ident, "region1");
    }

    #[test]
    fn test_start_tls_args_default_authorities() {
        let parsed: commands::StartTlsArgs =
            serde_json::from_value(json!({"certificate": "pem"})).unwrap();
        assert!(parsed.authorities.is_empty());
    }
}
