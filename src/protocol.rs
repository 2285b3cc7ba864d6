//! The packfile transfer protocol: ref advertisement, fetch negotiation
//! (upload-pack) and push processing (receive-pack).
//!
//! Each function consumes a full pkt-line request buffer and produces a
//! response buffer, the shape the smart HTTP transport needs. Substream
//! boundaries are honored through the pkt-line reader's flush parking.

use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use crate::object::{Object, ObjectId};
use crate::pack::{PackReader, PackWriter};
use crate::pktline::{PktLine, PktReader, PktWriter};
use crate::repo::{get_tag, has_object, reachable, Repository};
use crate::{Error, Result};

/// The protocol capabilities this server advertises and accepts.
pub const CAPABILITIES: &[&str] = &[
    "delete-refs",
    "multi_ack_detailed",
    "no-done",
    "ofs-delta",
    "report-status",
];

/// The advertised capability list as one space-separated string.
pub fn capability_string() -> String {
    CAPABILITIES.join(" ")
}

fn parse_caps(s: &str) -> BTreeSet<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// Reject any capability we did not advertise.
fn check_caps(caps: &BTreeSet<String>) -> Result<()> {
    let unknown: Vec<&str> = caps
        .iter()
        .map(String::as_str)
        .filter(|c| !CAPABILITIES.contains(c))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(Error::UnknownCapability(unknown.join(" ")))
    }
}

fn line_str(line: &[u8]) -> Result<&str> {
    let s = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("command line is not utf-8".into()))?;
    Ok(s.strip_suffix('\n').unwrap_or(s))
}

fn parse_id(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).ok_or_else(|| Error::Protocol(format!("bad object id: {:?}", hex)))
}

/// Write the initial capability-and-ref dump for a connecting client.
///
/// The first line carries the capability list after a NUL; annotated
/// tags are followed by a peeled `^{}` line. An empty repository
/// advertises a single synthetic `capabilities^{}` line.
pub fn advertise_refs(repo: &dyn Repository) -> Result<Vec<u8>> {
    let refs = repo.list_refs()?;
    let mut out = PktWriter::new();
    let caps = capability_string();
    let mut first = true;

    debug!(refs = refs.len(), "advertising refs");
    if let Ok(id) = repo.head().and_then(|name| repo.get_ref(&name)) {
        out.write_text(&format!("{} HEAD\0{}", id, caps))?;
        first = false;
    }
    for (name, id) in &refs {
        if first {
            out.write_text(&format!("{} {}\0{}", id, name, caps))?;
            first = false;
        } else {
            out.write_text(&format!("{} {}", id, name))?;
        }
        if let Ok((tag, _)) = get_tag(repo, *id) {
            out.write_text(&format!("{} {}^{{}}", tag.object, name))?;
        }
    }
    if first {
        out.write_text(&format!("{} capabilities^{{}}\0{}", ObjectId::ZERO, caps))?;
    }
    out.flush();
    Ok(out.into_bytes())
}

/// Serve a fetch: read `want` and `have` substreams, answer with the
/// ACK/NAK tokens the negotiation requires, and append a packfile of
/// the objects reachable from the wants but not from the common set.
pub fn upload_pack(repo: &dyn Repository, input: &[u8]) -> Result<Vec<u8>> {
    let mut pktr = PktReader::new(input);
    let mut out = PktWriter::new();

    // First substream: want lines, capabilities on the first.
    let mut wants: Vec<ObjectId> = Vec::new();
    let mut caps = BTreeSet::new();
    loop {
        match pktr.read_line()? {
            PktLine::Data(line) => {
                let line = line_str(line)?;
                let rest = line
                    .strip_prefix("want ")
                    .ok_or_else(|| Error::Protocol(format!("expected want: {:?}", line)))?;
                let (id_hex, line_caps) = match rest.split_once(' ') {
                    Some((id_hex, caps)) => (id_hex, Some(caps)),
                    None => (rest, None),
                };
                if wants.is_empty() {
                    if let Some(line_caps) = line_caps {
                        caps = parse_caps(line_caps);
                    }
                }
                wants.push(parse_id(id_hex)?);
            }
            PktLine::Flush | PktLine::End => break,
        }
    }
    if wants.is_empty() {
        return Ok(out.into_bytes());
    }
    check_caps(&caps)?;
    let multi_ack = caps.contains("multi_ack_detailed");
    debug!(wants = wants.len(), multi_ack, "negotiating fetch");

    // Have substreams, until a done line or the end of the request.
    let mut common: Vec<ObjectId> = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut acked = false;
    let mut done = false;
    'negotiate: while !done {
        if !pktr.next()? {
            // Client hung up before done: no packfile.
            return Ok(out.into_bytes());
        }
        loop {
            match pktr.read_line()? {
                PktLine::Data(line) => {
                    let line = line_str(line)?;
                    if line == "done" {
                        done = true;
                        break;
                    }
                    let id_hex = line
                        .strip_prefix("have ")
                        .ok_or_else(|| Error::Protocol(format!("bad command: {:?}", line)))?;
                    let id = parse_id(id_hex)?;
                    if !seen.insert(id) || !has_object(repo, &id)? {
                        continue;
                    }
                    common.push(id);
                    if multi_ack {
                        out.write_text(&format!("ACK {} common", id))?;
                    } else if !acked {
                        out.write_text(&format!("ACK {}", id))?;
                        acked = true;
                    }
                }
                PktLine::Flush => {
                    if multi_ack || !acked {
                        out.write_text("NAK")?;
                    }
                    continue 'negotiate;
                }
                PktLine::End => {
                    return Ok(out.into_bytes());
                }
            }
        }
    }
    match common.last() {
        Some(last) if multi_ack => out.write_text(&format!("ACK {}", last))?,
        Some(_) => {}
        None => out.write_text("NAK")?,
    }

    // The transfer set, ordered by type then descending size to help
    // the receiving side re-delta.
    let mut objs: Vec<(ObjectId, Object)> = reachable(repo, &wants, &common)?;
    objs.sort_by_key(|(_, obj)| (obj.kind().code(), std::cmp::Reverse(obj.approx_size())));
    info!(objects = objs.len(), "writing packfile");
    let mut pack = PackWriter::new(objs.len() as u64)?;
    for (_, obj) in &objs {
        pack.write_object(obj)?;
    }
    out.write_raw(&pack.close());
    Ok(out.into_bytes())
}

struct RefCommand {
    old: ObjectId,
    new: ObjectId,
    name: String,
}

/// Bytes allowed in a refname token of a push command line.
fn valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b >= 0x20 && !b" *:?[^~".contains(&b))
}

/// Serve a push: read ref update commands and the packfile that follows,
/// store the objects, apply each update, and report per-ref outcomes if
/// the client asked for them with report-status.
pub fn receive_pack(repo: &dyn Repository, input: &[u8]) -> Result<Vec<u8>> {
    let mut pktr = PktReader::new(input);
    let mut cmds: Vec<RefCommand> = Vec::new();
    let mut caps = BTreeSet::new();
    loop {
        match pktr.read_line()? {
            PktLine::Data(line) => {
                let line = line_str(line)?;
                let (cmd, line_caps) = match line.split_once('\0') {
                    Some((cmd, caps)) => (cmd, Some(caps)),
                    None => (line, None),
                };
                if let Some(line_caps) = line_caps {
                    if !cmds.is_empty() {
                        return Err(Error::Protocol(
                            "capabilities after the first command".into(),
                        ));
                    }
                    caps = parse_caps(line_caps);
                }
                let mut fields = cmd.splitn(3, ' ');
                let (old, new, name) = match (fields.next(), fields.next(), fields.next()) {
                    (Some(old), Some(new), Some(name)) => (old, new, name),
                    _ => return Err(Error::Protocol(format!("bad command: {:?}", cmd))),
                };
                if !valid_command_name(name) {
                    return Err(Error::Protocol(format!("bad refname: {:?}", name)));
                }
                cmds.push(RefCommand {
                    old: parse_id(old)?,
                    new: parse_id(new)?,
                    name: name.to_string(),
                });
            }
            PktLine::Flush | PktLine::End => break,
        }
    }
    check_caps(&caps)?;
    let report = caps.contains("report-status");
    info!(commands = cmds.len(), report, "processing push");

    let mut out = PktWriter::new();
    // A packfile follows unless every command is a deletion.
    let delete_only = cmds.iter().all(|cmd| cmd.new.is_zero());
    let unpacked = if delete_only {
        Ok(())
    } else {
        unpack(repo, pktr.remaining())
    };
    match unpacked {
        // "unpack ok" is expected even when no packfile was read.
        Ok(()) => out.write_text("unpack ok")?,
        Err(Error::Io(err)) => return Err(Error::Io(err)),
        Err(err) => {
            warn!(%err, "unpack failed");
            out.write_text(&format!("unpack {}", err))?;
        }
    }

    for cmd in &cmds {
        match repo.update_ref(&cmd.name, cmd.old, cmd.new) {
            Ok(()) => out.write_text(&format!("ok {}", cmd.name))?,
            Err(err) => out.write_text(&format!("ng {} {}", cmd.name, err))?,
        }
    }
    out.flush();

    if report {
        Ok(out.into_bytes())
    } else {
        Ok(Vec::new())
    }
}

/// Read a packfile and store every object it yields.
fn unpack(repo: &dyn Repository, data: &[u8]) -> Result<()> {
    let mut reader = PackReader::with_repository(data, repo)?;
    while reader.remaining() > 0 {
        let (_, obj) = reader.read_object()?;
        repo.put_object(obj)?;
    }
    reader.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::object::{Commit, ObjectType, Signature, Tag, Tree};

    fn sig() -> Signature {
        Signature::new("T", "t@t", 1, 0)
    }

    fn store_commit(repo: &MemoryRepository, parents: Vec<ObjectId>, msg: &[u8]) -> ObjectId {
        let tree = repo.put_object(Object::Tree(Tree::new())).unwrap();
        repo.put_object(Object::Commit(Commit {
            tree,
            parents,
            author: sig(),
            committer: sig(),
            message: msg.to_vec(),
        }))
        .unwrap()
    }

    fn lines(buf: &[u8]) -> Vec<String> {
        let mut pktr = PktReader::new(buf);
        let mut lines = Vec::new();
        loop {
            match pktr.read_line().unwrap() {
                PktLine::Data(line) => {
                    lines.push(String::from_utf8_lossy(line).trim_end().to_string())
                }
                PktLine::Flush | PktLine::End => return lines,
            }
        }
    }

    #[test]
    fn test_advertise_empty_repository() {
        let repo = MemoryRepository::new();
        let out = advertise_refs(&repo).unwrap();
        let lines = lines(&out);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(
            "0000000000000000000000000000000000000000 capabilities^{}\0"
        ));
        assert!(lines[0].contains("multi_ack_detailed"));
        assert!(lines[0].contains("report-status"));
    }

    #[test]
    fn test_advertise_head_first_and_tag_peel() {
        let repo = MemoryRepository::new();
        let commit = store_commit(&repo, vec![], b"c");
        repo.update_ref("refs/heads/master", ObjectId::ZERO, commit)
            .unwrap();
        let tag = repo
            .put_object(Object::Tag(Tag {
                object: commit,
                target_type: ObjectType::Commit,
                tag: "v1".into(),
                tagger: sig(),
                message: vec![],
            }))
            .unwrap();
        repo.update_ref("refs/tags/v1", ObjectId::ZERO, tag).unwrap();

        let out = advertise_refs(&repo).unwrap();
        let lines = lines(&out);
        assert_eq!(lines[0], format!("{} HEAD\0{}", commit, capability_string()));
        assert_eq!(lines[1], format!("{} refs/heads/master", commit));
        assert_eq!(lines[2], format!("{} refs/tags/v1", tag));
        assert_eq!(lines[3], format!("{} refs/tags/v1^{{}}", commit));
    }

    fn fetch_request(wants: &[ObjectId], caps: &str, haves: &[&[ObjectId]], done: bool) -> Vec<u8> {
        let mut req = PktWriter::new();
        for (i, want) in wants.iter().enumerate() {
            if i == 0 && !caps.is_empty() {
                req.write_text(&format!("want {} {}", want, caps)).unwrap();
            } else {
                req.write_text(&format!("want {}", want)).unwrap();
            }
        }
        req.flush();
        for block in haves {
            for have in *block {
                req.write_text(&format!("have {}", have)).unwrap();
            }
            req.flush();
        }
        if done {
            req.write_text("done").unwrap();
        }
        req.into_bytes()
    }

    fn read_pack_ids(repo: &MemoryRepository, pack: &[u8]) -> Vec<ObjectId> {
        let mut reader = PackReader::new(pack).unwrap();
        let mut ids = Vec::new();
        while reader.remaining() > 0 {
            let (id, obj) = reader.read_object().unwrap();
            repo.put_object(obj).unwrap();
            ids.push(id);
        }
        reader.close().unwrap();
        ids
    }

    #[test]
    fn test_upload_pack_no_wants_is_silent() {
        let repo = MemoryRepository::new();
        let out = upload_pack(&repo, b"0000").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_upload_pack_rejects_unknown_capability() {
        let repo = MemoryRepository::new();
        let commit = store_commit(&repo, vec![], b"c");
        let req = fetch_request(&[commit], "multi_ack_detailed bogus-cap", &[], true);
        assert!(matches!(
            upload_pack(&repo, &req),
            Err(Error::UnknownCapability(caps)) if caps == "bogus-cap"
        ));
    }

    #[test]
    fn test_upload_pack_immediate_done() {
        let repo = MemoryRepository::new();
        let commit = store_commit(&repo, vec![], b"c");
        let req = fetch_request(&[commit], "multi_ack_detailed", &[&[]], true);
        let out = upload_pack(&repo, &req).unwrap();

        // NAK for the empty have block, NAK for done with no common.
        let mut pktr = PktReader::new(&out);
        assert_eq!(pktr.read_line().unwrap(), PktLine::Data(b"NAK\n"));
        assert_eq!(pktr.read_line().unwrap(), PktLine::Data(b"NAK\n"));
        let dest = MemoryRepository::new();
        let ids = read_pack_ids(&dest, pktr.remaining());
        assert_eq!(ids.len(), 2); // the commit and its empty tree
        assert!(ids.contains(&commit));
    }

    #[test]
    fn test_upload_pack_multi_ack_negotiation() {
        // Chain c3 -> c2 -> c1; the client has c1.
        let repo = MemoryRepository::new();
        let c1 = store_commit(&repo, vec![], b"one");
        let c2 = store_commit(&repo, vec![c1], b"two");
        let c3 = store_commit(&repo, vec![c2], b"three");
        let unknown =
            ObjectId::from_hex("9999999999999999999999999999999999999999").unwrap();

        let req = fetch_request(&[c3], "multi_ack_detailed", &[&[unknown, c1]], true);
        let out = upload_pack(&repo, &req).unwrap();

        let mut pktr = PktReader::new(&out);
        assert_eq!(
            pktr.read_line().unwrap(),
            PktLine::Data(format!("ACK {} common\n", c1).as_bytes())
        );
        assert_eq!(pktr.read_line().unwrap(), PktLine::Data(b"NAK\n"));
        assert_eq!(
            pktr.read_line().unwrap(),
            PktLine::Data(format!("ACK {}\n", c1).as_bytes())
        );

        // The client holds c1 and through it the shared empty tree, so
        // the pack carries exactly c3 and c2.
        let dest = MemoryRepository::new();
        let ids = read_pack_ids(&dest, pktr.remaining());
        let set: std::collections::HashSet<_> = ids.iter().copied().collect();
        assert_eq!(set, std::collections::HashSet::from([c3, c2]));
    }

    #[test]
    fn test_upload_pack_single_ack_acks_first_common() {
        let repo = MemoryRepository::new();
        let c1 = store_commit(&repo, vec![], b"one");
        let c2 = store_commit(&repo, vec![c1], b"two");
        let c3 = store_commit(&repo, vec![c2], b"three");

        let req = fetch_request(&[c3], "", &[&[c1, c2]], true);
        let out = upload_pack(&repo, &req).unwrap();
        let mut pktr = PktReader::new(&out);
        assert_eq!(
            pktr.read_line().unwrap(),
            PktLine::Data(format!("ACK {}\n", c1).as_bytes())
        );
        // No further tokens: the raw pack follows the single ACK.
        assert!(pktr.remaining().starts_with(b"PACK"));
    }

    #[test]
    fn test_upload_pack_eof_before_done_sends_no_pack() {
        let repo = MemoryRepository::new();
        let commit = store_commit(&repo, vec![], b"c");
        let req = fetch_request(&[commit], "multi_ack_detailed", &[&[]], false);
        let out = upload_pack(&repo, &req).unwrap();
        // One NAK for the have block, then nothing.
        assert_eq!(out, b"0008NAK\n");
    }

    fn push_request(cmds: &[(ObjectId, ObjectId, &str)], caps: &str, pack: Option<&[u8]>) -> Vec<u8> {
        let mut req = PktWriter::new();
        for (i, (old, new, name)) in cmds.iter().enumerate() {
            if i == 0 {
                req.write_text(&format!("{} {} {}\0{}", old, new, name, caps))
                    .unwrap();
            } else {
                req.write_text(&format!("{} {} {}", old, new, name)).unwrap();
            }
        }
        req.flush();
        if let Some(pack) = pack {
            req.write_raw(pack);
        }
        req.into_bytes()
    }

    fn pack_of(objs: &[Object]) -> Vec<u8> {
        let mut w = PackWriter::new(objs.len() as u64).unwrap();
        for obj in objs {
            w.write_object(obj).unwrap();
        }
        w.close()
    }

    #[test]
    fn test_receive_pack_creates_ref() {
        let repo = MemoryRepository::new();
        let blob = Object::Blob(b"hello\n".to_vec());
        let blob_id = blob.id();
        let req = push_request(
            &[(ObjectId::ZERO, blob_id, "refs/heads/master")],
            "report-status",
            Some(&pack_of(&[blob])),
        );
        let out = receive_pack(&repo, &req).unwrap();
        assert_eq!(
            lines(&out),
            vec!["unpack ok".to_string(), "ok refs/heads/master".to_string()]
        );
        assert_eq!(repo.get_ref("refs/heads/master").unwrap(), blob_id);
    }

    #[test]
    fn test_receive_pack_without_report_status_is_silent() {
        let repo = MemoryRepository::new();
        let blob = Object::Blob(b"quiet".to_vec());
        let blob_id = blob.id();
        let req = push_request(
            &[(ObjectId::ZERO, blob_id, "refs/heads/master")],
            "",
            Some(&pack_of(&[blob])),
        );
        let out = receive_pack(&repo, &req).unwrap();
        assert!(out.is_empty());
        assert_eq!(repo.get_ref("refs/heads/master").unwrap(), blob_id);
    }

    #[test]
    fn test_receive_pack_delete_only_expects_no_pack() {
        let repo = MemoryRepository::new();
        let blob_id = repo.put_object(Object::Blob(b"x".to_vec())).unwrap();
        repo.update_ref("refs/heads/gone", ObjectId::ZERO, blob_id)
            .unwrap();
        let req = push_request(
            &[(blob_id, ObjectId::ZERO, "refs/heads/gone")],
            "report-status delete-refs",
            None,
        );
        let out = receive_pack(&repo, &req).unwrap();
        assert_eq!(
            lines(&out),
            vec!["unpack ok".to_string(), "ok refs/heads/gone".to_string()]
        );
        assert!(matches!(
            repo.get_ref("refs/heads/gone"),
            Err(Error::RefNotExist)
        ));
    }

    #[test]
    fn test_receive_pack_reports_per_ref_failures() {
        let repo = MemoryRepository::new();
        let held = repo.put_object(Object::Blob(b"held".to_vec())).unwrap();
        repo.update_ref("refs/heads/busy", ObjectId::ZERO, held)
            .unwrap();

        let blob = Object::Blob(b"new".to_vec());
        let blob_id = blob.id();
        let stale = repo.put_object(Object::Blob(b"stale".to_vec())).unwrap();
        let req = push_request(
            &[
                (stale, blob_id, "refs/heads/busy"),
                (ObjectId::ZERO, blob_id, "refs/heads/fresh"),
            ],
            "report-status",
            Some(&pack_of(&[blob])),
        );
        let out = receive_pack(&repo, &req).unwrap();
        let lines = lines(&out);
        assert_eq!(lines[0], "unpack ok");
        assert!(lines[1].starts_with("ng refs/heads/busy "));
        assert_eq!(lines[2], "ok refs/heads/fresh");
        // The failed command did not roll back stored objects.
        assert_eq!(repo.get_ref("refs/heads/busy").unwrap(), held);
        assert_eq!(repo.get_ref("refs/heads/fresh").unwrap(), blob_id);
    }

    #[test]
    fn test_receive_pack_reports_unpack_failure() {
        let repo = MemoryRepository::new();
        let blob_id = Object::Blob(b"z".to_vec()).id();
        let req = push_request(
            &[(ObjectId::ZERO, blob_id, "refs/heads/z")],
            "report-status",
            Some(b"JUNKJUNKJUNK"),
        );
        let out = receive_pack(&repo, &req).unwrap();
        let lines = lines(&out);
        assert!(lines[0].starts_with("unpack "));
        assert_ne!(lines[0], "unpack ok");
        assert!(lines[1].starts_with("ng refs/heads/z "));
    }

    #[test]
    fn test_receive_pack_rejects_unknown_capability() {
        let repo = MemoryRepository::new();
        let req = push_request(
            &[(ObjectId::ZERO, ObjectId::ZERO, "refs/heads/x")],
            "report-status push-cert",
            None,
        );
        assert!(matches!(
            receive_pack(&repo, &req),
            Err(Error::UnknownCapability(_))
        ));
    }

    #[test]
    fn test_receive_pack_rejects_bad_refname_bytes() {
        let repo = MemoryRepository::new();
        let req = push_request(
            &[(ObjectId::ZERO, ObjectId::ZERO, "refs/heads/a^b")],
            "report-status",
            None,
        );
        assert!(matches!(receive_pack(&repo, &req), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_receive_pack_empty_command_list() {
        let repo = MemoryRepository::new();
        let out = receive_pack(&repo, b"0000").unwrap();
        // No capabilities were given, so no report is written.
        assert!(out.is_empty());
    }
}
