/// One file on the device, as reported by the remote listing command.
///
/// Produced fresh on every sync run and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub path: String,
    pub mod_time: i64,
    pub size: u64,
}

/// Parses `stat -c '%Y %s %n'` output: one `<mtime> <size> <path>` record
/// per line, whitespace-delimited, with the path taking the remainder of
/// the line. Malformed lines are skipped. Paths containing newlines are not
/// representable in this format; the listing side does not validate for
/// embedded delimiters.
pub fn parse_listing(output: &str) -> Vec<RemoteObject> {
    let mut objects = Vec::new();
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        let (Some(mtime), Some(size), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let (Ok(mod_time), Ok(size)) = (mtime.parse::<i64>(), size.parse::<u64>()) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        objects.push(RemoteObject {
            path: path.to_string(),
            mod_time,
            size,
        });
    }
    objects
}
