//! Image definition for the lab container.
//!
//! The build context (Dockerfile, `ntp.conf` and the cron entry that runs
//! the in-container collector) is rendered from [`Config`] and packed into
//! an in-memory tar archive, which is what the Docker build API expects.

use anyhow::Result;

use crate::config::Config;

/// Name of the cron entry inside `/etc/cron.d`.
pub const CRON_ENTRY: &str = "ntp-collector";

/// Header format shared by the cron one-liner and [`crate::collector`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub fn dockerfile(cfg: &Config) -> String {
    let user = &cfg.user;
    let log_dir = cfg.container_log_dir.trim_end_matches('/');
    format!(
        "FROM {base}\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         RUN apt-get update \\\n    \
         && apt-get install -y --no-install-recommends ntp cron procps tzdata \\\n    \
         && rm -rf /var/lib/apt/lists/*\n\
         RUN useradd --create-home --shell {shell} {user}\n\
         COPY ntp.conf /etc/ntp.conf\n\
         RUN mkdir -p {log_dir} && chown {user}:{user} {log_dir}\n\
         COPY {cron} /etc/cron.d/{cron}\n\
         RUN chmod 0644 /etc/cron.d/{cron}\n\
         CMD [\"/bin/sh\", \"-c\", \"service ntp start && exec cron -f\"]\n",
        base = cfg.base_image,
        shell = cfg.shell,
        cron = CRON_ENTRY,
    )
}

pub fn ntp_conf(cfg: &Config) -> String {
    let mut conf = String::from(
        "driftfile /var/lib/ntp/ntp.drift\n\
         leapfile /usr/share/zoneinfo/leap-seconds.list\n\
         \n\
         restrict -4 default kod notrap nomodify nopeer noquery limited\n\
         restrict -6 default kod notrap nomodify nopeer noquery limited\n\
         restrict 127.0.0.1\n\
         restrict ::1\n\
         \n",
    );
    for server in &cfg.servers {
        conf.push_str(&format!("server {} iburst\n", server));
    }
    conf
}

/// Quote `arg` for `/bin/sh`; plain words pass through unchanged.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// The in-container collector: one timestamp line, the peer table (errors
/// included), one blank line, appended on a fixed interval.
pub fn cron_entry(cfg: &Config) -> String {
    let stamp = cron_escape(TIMESTAMP_FORMAT);
    format!(
        "SHELL=/bin/sh\n\
         PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n\
         */{every} * * * * root {{ echo \"=== $(date -u '+{stamp}') ===\"; {query} 2>&1; echo; }} >> {log}\n",
        every = cfg.collect_interval_minutes,
        query = cron_escape(&shell_command(&cfg.peer_query)),
        log = cron_escape(&shell_quote(&cfg.container_log_path())),
    )
}

fn shell_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

// cron treats a bare % as a newline
fn cron_escape(s: &str) -> String {
    s.replace('%', "\\%")
}

/// Pack the rendered build context into a tar archive.
pub fn build_context(cfg: &Config) -> Result<Vec<u8>> {
    let files = [
        ("Dockerfile", dockerfile(cfg)),
        ("ntp.conf", ntp_conf(cfg)),
        (CRON_ENTRY, cron_entry(cfg)),
    ];

    let mut archive = tar::Builder::new(Vec::new());
    for (path, contents) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        archive.append_data(&mut header, path, contents.as_bytes())?;
    }
    Ok(archive.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn dockerfile_installs_service_user_and_schedule() {
        let df = dockerfile(&Config::default());
        assert!(df.starts_with("FROM ubuntu:22.04\n"));
        assert!(df.contains("apt-get install -y --no-install-recommends ntp cron"));
        assert!(df.contains("useradd --create-home --shell /bin/bash ntpuser"));
        assert!(df.contains("COPY ntp.conf /etc/ntp.conf"));
        assert!(df.contains("mkdir -p /var/log/ntp-logs && chown ntpuser:ntpuser /var/log/ntp-logs"));
        assert!(df.contains("COPY ntp-collector /etc/cron.d/ntp-collector"));
        assert!(df.contains("service ntp start && exec cron -f"));
    }

    #[test]
    fn ntp_conf_lists_every_server() {
        let cfg = Config::default();
        let conf = ntp_conf(&cfg);
        for server in &cfg.servers {
            assert!(conf.contains(&format!("server {} iburst\n", server)));
        }
        assert_eq!(conf.matches("server ").count(), cfg.servers.len());
    }

    #[test]
    fn cron_entry_escapes_percent_and_appends_to_log() {
        let entry = cron_entry(&Config::default());
        let job = entry.lines().last().unwrap();
        assert!(job.starts_with("*/20 * * * * root "));
        assert!(job.contains(r"date -u '+\%Y-\%m-\%d \%H:\%M:\%S UTC'"));
        assert!(job.contains("ntpq -p 2>&1; echo;"));
        assert!(job.ends_with(">> /var/log/ntp-logs/ntplog.txt"));
        assert!(entry.ends_with('\n'));
    }

    #[test]
    fn shell_quote_leaves_words_and_wraps_the_rest() {
        assert_eq!(shell_quote("ntpq"), "ntpq");
        assert_eq!(shell_quote("-p"), "-p");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn cron_entry_quotes_query_arguments() {
        let cfg = Config {
            peer_query: vec!["ntpq".into(), "-c".into(), "peers; rm -rf /".into(), "100%".into()],
            ..Config::default()
        };
        let entry = cron_entry(&cfg);
        let job = entry.lines().last().unwrap();
        assert!(job.contains(r"ntpq -c 'peers; rm -rf /' '100\%' 2>&1; echo;"));
    }

    #[test]
    fn context_archive_holds_three_files() {
        let cfg = Config::default();
        let bytes = build_context(&cfg).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());

        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            if path == "Dockerfile" {
                assert_eq!(body, dockerfile(&cfg));
            }
            seen.push(path);
        }
        assert_eq!(seen, vec!["Dockerfile", "ntp.conf", CRON_ENTRY]);
    }
}
