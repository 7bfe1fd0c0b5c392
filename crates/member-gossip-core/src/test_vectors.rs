//! Golden wire vectors
//!
//! Byte-exact encodings other implementations of the protocol must agree
//! with. Any change here is a wire-format break.

use crate::codec::{decode, pack_node_tags, pack_with_header};
use crate::types::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// A named expected encoding
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub inputs: serde_json::Value,
    pub wire_hex: String,
}

/// Generate all test vectors
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        member_join_vector(),
        member_leave_vector(),
        request_vector(),
        push_pull_vector(),
        node_tags_vector(),
    ]
}

fn member_join_vector() -> TestVector {
    let msg = MemberJoin {
        join_time: 5,
        node_name: "B".into(),
    };
    TestVector {
        name: "member_join".into(),
        inputs: serde_json::json!({ "join_time": 5, "node_name": "B" }),
        wire_hex: hex::encode(pack_with_header(&msg).unwrap()),
    }
}

fn member_leave_vector() -> TestVector {
    let msg = MemberLeave {
        leave_time: 6,
        node_name: "B".into(),
    };
    TestVector {
        name: "member_leave".into(),
        inputs: serde_json::json!({ "leave_time": 6, "node_name": "B" }),
        wire_hex: hex::encode(pack_with_header(&msg).unwrap()),
    }
}

fn request_vector() -> TestVector {
    let msg = Request {
        request_time: 300,
        request_node_name: "A".into(),
        request_name: "q".into(),
        payload: vec![9],
    };
    TestVector {
        name: "request".into(),
        inputs: serde_json::json!({
            "request_time": 300,
            "request_node_name": "A",
            "request_name": "q",
            "payload": [9],
        }),
        wire_hex: hex::encode(pack_with_header(&msg).unwrap()),
    }
}

fn push_pull_vector() -> TestVector {
    let mut times = BTreeMap::new();
    times.insert("B".to_string(), 6);
    times.insert("C".to_string(), 2);
    let msg = PushPull {
        member_clock_time: 7,
        request_clock_time: 0,
        member_last_message_times: times,
        left_member_names: vec!["B".into()],
    };
    TestVector {
        name: "push_pull".into(),
        inputs: serde_json::json!({
            "member_clock_time": 7,
            "request_clock_time": 0,
            "member_last_message_times": { "B": 6, "C": 2 },
            "left_member_names": ["B"],
        }),
        wire_hex: hex::encode(pack_with_header(&msg).unwrap()),
    }
}

fn node_tags_vector() -> TestVector {
    let mut tags = NodeTags::new();
    tags.insert("r".into(), "gw".into());
    TestVector {
        name: "node_tags".into(),
        inputs: serde_json::json!({ "r": "gw" }),
        wire_hex: hex::encode(pack_node_tags(&tags).unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(name: &str) -> String {
        generate_test_vectors()
            .into_iter()
            .find(|v| v.name == name)
            .map(|v| v.wire_hex)
            .unwrap()
    }

    #[test]
    fn test_member_join_bytes() {
        // tag 0, varint 5, len 1, "B"
        assert_eq!(vector("member_join"), "00050142");
    }

    #[test]
    fn test_member_leave_bytes() {
        assert_eq!(vector("member_leave"), "01060142");
    }

    #[test]
    fn test_request_bytes() {
        // 300 = varint ac 02
        assert_eq!(vector("request"), "02ac02014101710109");
    }

    #[test]
    fn test_push_pull_bytes() {
        // map len 2: "B"->6, "C"->2; left list len 1: "B"
        assert_eq!(vector("push_pull"), "05070002014206014302010142");
    }

    #[test]
    fn test_node_tags_bytes() {
        assert_eq!(vector("node_tags"), "010172026777");
    }

    #[test]
    fn test_vectors_decode_back() {
        for v in generate_test_vectors() {
            if v.name == "node_tags" {
                continue;
            }
            let bytes = hex::decode(&v.wire_hex).unwrap();
            let msg = decode(&bytes).unwrap();
            assert_eq!(msg.encode().unwrap(), bytes, "vector {}", v.name);
        }
    }

    #[test]
    fn test_vectors_serialize_to_json() {
        let json = serde_json::to_string(&generate_test_vectors()).unwrap();
        assert!(json.contains("member_join"));
    }
}
