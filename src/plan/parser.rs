//! Extracted-backup parser
//!
//! Reads the tree produced by the extractor and builds a `MigrationPlan`.
//! Every concern is parsed independently; a failing concern leaves its list
//! empty and contributes a warning, siblings are unaffected.
//!
//! Layout understood (relative to the backup root):
//! - `cp/<user>`: `KEY=VALUE` account metadata (`USER`, `DNS`)
//! - `version`: archive version string
//! - `userdata/main`, `userdata/<domain>`: domain inventory and document roots
//! - `homedir/etc/<domain>/passwd`, `homedir/mail/<domain>/<local>`: mailboxes
//! - `va/<domain>`: forwarders, `mm/<list>_<domain>`: mailing lists
//! - `mysql/*.sql`, `mysql.sql` grants, `psql/*.tar`: databases
//! - `dnszones/*.db`: zone files
//! - `sslcerts/*.crt`, `sslkeys/*.key`: certificates

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;

use super::errors::{ParseError, ParseResult};
use super::types::{
    DatabaseType, DomainKind, MigrationDatabase, MigrationDnsZone, MigrationDomain,
    MigrationEmail, MigrationPlan, MigrationSsl,
};

/// Facts about the archive known before parsing.
#[derive(Debug, Clone, Default)]
pub struct BackupMeta {
    pub format: String,
    pub backup_date: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub source_user_hint: Option<String>,
}

/// Account metadata from `cp/<user>` and `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AccountMeta {
    user: Option<String>,
    dns: Option<String>,
    version: Option<String>,
}

/// Descend into the single top-level directory when the archive has one.
pub fn locate_backup_root(extract_dir: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = match fs::read_dir(extract_dir) {
        Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => return extract_dir.to_path_buf(),
    };

    match entries.as_slice() {
        [only] if only.is_dir() => only.clone(),
        _ => extract_dir.to_path_buf(),
    }
}

/// Build a plan from an extracted backup.
pub fn parse_backup(extract_dir: &Path, target_user: &str, meta: &BackupMeta) -> MigrationPlan {
    let root = locate_backup_root(extract_dir);
    let mut warnings = Vec::new();

    let account = collect(parse_account(&root), "userdata", &mut warnings);
    let source_user = account
        .user
        .clone()
        .or_else(|| meta.source_user_hint.clone())
        .or_else(|| {
            root.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("cpmove-"))
                .map(str::to_string)
        })
        .unwrap_or_else(|| target_user.to_string());

    let mut plan = MigrationPlan::new(target_user, source_user.clone());
    plan.backup_format = meta.format.clone();
    plan.backup_version = account.version.clone();
    plan.backup_date = meta.backup_date;
    plan.total_size = meta.total_size;

    plan.domains = collect(
        parse_domains(&root, &source_user, account.dns.as_deref()),
        "domains",
        &mut warnings,
    );
    let (email_accounts, email_skipped) = collect(parse_email(&root), "email", &mut warnings);
    plan.email_accounts = email_accounts;
    plan.databases = collect(parse_databases(&root, &source_user), "databases", &mut warnings);
    plan.dns_zones = collect(parse_dns(&root), "dns", &mut warnings);

    let (certificates, skip_reasons) = collect(parse_ssl(&root), "ssl", &mut warnings);
    plan.ssl_certificates = certificates;
    plan.skip_reasons = email_skipped;
    plan.skip_reasons.extend(skip_reasons);

    for domain in &mut plan.domains {
        domain.ssl = plan
            .ssl_certificates
            .iter()
            .any(|c| c.domain == domain.name && c.has_private_key);
    }

    plan.warnings = warnings;
    plan
}

fn collect<T: Default>(result: ParseResult<T>, concern: &str, warnings: &mut Vec<String>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warnings.push(e.as_warning(concern));
            T::default()
        }
    }
}

fn parse_account(root: &Path) -> ParseResult<AccountMeta> {
    let cp_dir = root.join("cp");
    let files = list_dir(&cp_dir)?.ok_or_else(|| ParseError::Missing("cp/".to_string()))?;
    let file = files
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ParseError::Missing("cp/<user>".to_string()))?;

    let mut meta = AccountMeta::default();
    for line in read_text(&file)?.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "USER" => meta.user = Some(value.to_string()),
                "DNS" => meta.dns = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let version = root.join("version");
    if version.is_file() {
        let text = read_text(&version)?;
        let text = text.trim();
        if !text.is_empty() {
            meta.version = Some(text.to_string());
        }
    }

    Ok(meta)
}

/// `userdata/main` contents.
#[derive(Debug, Default, PartialEq, Eq)]
struct MainUserdata {
    main_domain: Option<String>,
    /// addon domain -> backing subdomain
    addon_domains: Vec<(String, String)>,
    parked_domains: Vec<String>,
    sub_domains: Vec<String>,
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(s)
}

fn parse_main_userdata(text: &str) -> ParseResult<MainUserdata> {
    let mut main = MainUserdata::default();
    let mut section = String::new();

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with("---") || line.trim_start().starts_with('#') {
            continue;
        }

        if !line.starts_with(char::is_whitespace) && !line.starts_with('-') {
            let (key, value) = line.split_once(':').ok_or_else(|| {
                ParseError::malformed("userdata/main", format!("line {}: expected key", idx + 1))
            })?;
            section = key.trim().to_string();
            if section == "main_domain" {
                let value = unquote(value);
                if !value.is_empty() {
                    main.main_domain = Some(value.to_string());
                }
            }
            continue;
        }

        let item = line.trim();
        if let Some(entry) = item.strip_prefix('-') {
            let entry = unquote(entry).to_string();
            match section.as_str() {
                "parked_domains" => main.parked_domains.push(entry),
                "sub_domains" => main.sub_domains.push(entry),
                _ => {}
            }
        } else if section == "addon_domains" {
            let (addon, sub) = item.split_once(':').ok_or_else(|| {
                ParseError::malformed(
                    "userdata/main",
                    format!("line {}: expected addon mapping", idx + 1),
                )
            })?;
            main.addon_domains
                .push((unquote(addon).to_string(), unquote(sub).to_string()));
        }
    }

    Ok(main)
}

fn document_root(userdata_dir: &Path, name: &str) -> ParseResult<Option<String>> {
    let path = userdata_dir.join(name);
    if !path.is_file() {
        return Ok(None);
    }
    Ok(read_text(&path)?.lines().find_map(|line| {
        line.trim()
            .strip_prefix("documentroot:")
            .map(|v| unquote(v).to_string())
    }))
}

/// Size of a document root's content inside `homedir/`.
fn docroot_size(root: &Path, source_user: &str, docroot: Option<&str>) -> u64 {
    let marker = format!("/{}/", source_user);
    docroot
        .and_then(|d| d.find(&marker).map(|i| &d[i + marker.len()..]))
        .map(|rest| root.join("homedir").join(rest))
        .and_then(|p| tree_size(&p).ok())
        .unwrap_or(0)
}

fn parse_domains(
    root: &Path,
    source_user: &str,
    dns_fallback: Option<&str>,
) -> ParseResult<Vec<MigrationDomain>> {
    let userdata_dir = root.join("userdata");
    let main_file = userdata_dir.join("main");

    let main = if main_file.is_file() {
        parse_main_userdata(&read_text(&main_file)?)?
    } else if let Some(dns) = dns_fallback {
        MainUserdata {
            main_domain: Some(dns.to_string()),
            ..Default::default()
        }
    } else {
        return Err(ParseError::Missing("userdata/main".to_string()));
    };

    let mut domains = Vec::new();
    let mut push = |name: &str, kind: DomainKind, userdata_name: &str| -> ParseResult<()> {
        let docroot = document_root(&userdata_dir, userdata_name)?;
        let size = docroot_size(root, source_user, docroot.as_deref());
        domains.push(MigrationDomain {
            name: name.to_string(),
            kind,
            is_addon: kind == DomainKind::Addon,
            document_root: docroot,
            size,
            ssl: false,
        });
        Ok(())
    };

    if let Some(name) = main.main_domain.as_deref() {
        push(name, DomainKind::Main, name)?;
    }
    for (addon, backing) in &main.addon_domains {
        push(addon, DomainKind::Addon, backing)?;
    }
    for parked in &main.parked_domains {
        push(parked, DomainKind::Parked, main.main_domain.as_deref().unwrap_or(parked))?;
    }
    for sub in &main.sub_domains {
        if main.addon_domains.iter().any(|(_, backing)| backing == sub) {
            continue;
        }
        push(sub, DomainKind::Sub, sub)?;
    }

    Ok(domains)
}

/// A passwd local part that names exactly one directory under the domain.
fn valid_local_part(local: &str) -> bool {
    !local.is_empty()
        && local != "."
        && local != ".."
        && !local.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

fn parse_email(root: &Path) -> ParseResult<(Vec<MigrationEmail>, Vec<String>)> {
    let homedir = root.join("homedir");
    let Some(domain_dirs) = list_dir(&homedir.join("etc"))? else {
        return Ok((Vec::new(), Vec::new()));
    };

    let forwarders = parse_forwarders(&root.join("va"))?;
    let lists = parse_mailing_lists(&root.join("mm"))?;

    let mut accounts = Vec::new();
    let mut skipped = Vec::new();
    for dir in domain_dirs.into_iter().filter(|p| p.is_dir()) {
        let passwd = dir.join("passwd");
        if !passwd.is_file() {
            continue;
        }
        let domain = file_name(&dir);

        for line in read_text(&passwd)?.lines() {
            let local = line.split(':').next().unwrap_or("").trim();
            if local.is_empty() {
                continue;
            }
            if !valid_local_part(local) {
                skipped.push(format!(
                    "mailbox {:?} in {} skipped: invalid local part",
                    local, domain
                ));
                continue;
            }
            let address = format!("{}@{}", local, domain);
            let maildir_rel = format!("homedir/mail/{}/{}", domain, local);
            let maildir = root.join(&maildir_rel);
            let has_mailbox = maildir.is_dir();
            let maildir_size = if has_mailbox {
                tree_size(&maildir).map_err(|e| ParseError::io(&maildir, e))?
            } else {
                0
            };

            accounts.push(MigrationEmail {
                forwarding: forwarders.get(&address).cloned().unwrap_or_default(),
                mailing_lists: lists.get(&domain).cloned().unwrap_or_default(),
                address,
                domain: domain.clone(),
                local_part: local.to_string(),
                has_mailbox,
                maildir_size,
                maildir: has_mailbox.then_some(maildir_rel),
            });
        }
    }

    Ok((accounts, skipped))
}

/// `va/<domain>`: `address: dest1, dest2`
fn parse_forwarders(va_dir: &Path) -> ParseResult<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let Some(files) = list_dir(va_dir)? else {
        return Ok(map);
    };

    for file in files.into_iter().filter(|p| p.is_file()) {
        for line in read_text(&file)?.lines() {
            let Some((address, dests)) = line.split_once(':') else {
                continue;
            };
            let address = address.trim();
            if address.is_empty() || address.starts_with('*') {
                continue;
            }
            map.entry(address.to_string()).or_default().extend(
                dests
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            );
        }
    }
    Ok(map)
}

/// `mm/<list>_<domain>` entries, grouped by domain as `list@domain`.
fn parse_mailing_lists(mm_dir: &Path) -> ParseResult<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let Some(entries) = list_dir(mm_dir)? else {
        return Ok(map);
    };

    for entry in entries {
        let name = file_name(&entry);
        if let Some((list, domain)) = name.rsplit_once('_') {
            if !list.is_empty() && domain.contains('.') {
                map.entry(domain.to_string())
                    .or_default()
                    .push(format!("{}@{}", list, domain));
            }
        }
    }
    Ok(map)
}

fn parse_databases(root: &Path, source_user: &str) -> ParseResult<Vec<MigrationDatabase>> {
    let grants = parse_grants(&root.join("mysql.sql"), source_user)?;
    let mut databases = Vec::new();

    if let Some(dumps) = list_dir(&root.join("mysql"))? {
        for dump in dumps.into_iter().filter(|p| has_extension(p, "sql")) {
            let name = file_stem(&dump);
            databases.push(MigrationDatabase {
                db_user: grants.get(&name).cloned(),
                size: file_size(&dump)?,
                table_count: count_tables(&dump)?,
                owner: source_user.to_string(),
                dump_file: relative(root, &dump),
                db_type: DatabaseType::Mysql,
                name,
            });
        }
    }

    if let Some(dumps) = list_dir(&root.join("psql"))? {
        for dump in dumps.into_iter().filter(|p| has_extension(p, "tar")) {
            databases.push(MigrationDatabase {
                name: file_stem(&dump),
                db_type: DatabaseType::Postgresql,
                db_user: None,
                size: file_size(&dump)?,
                table_count: 0,
                owner: source_user.to_string(),
                dump_file: relative(root, &dump),
            });
        }
    }

    Ok(databases)
}

fn count_tables(dump: &Path) -> ParseResult<usize> {
    let file = File::open(dump).map_err(|e| ParseError::io(dump, e))?;
    let mut count = 0;
    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|e| ParseError::io(dump, e))?;
        let line = String::from_utf8_lossy(&line);
        if line
            .trim_start()
            .get(..12)
            .map(|p| p.eq_ignore_ascii_case("CREATE TABLE"))
            .unwrap_or(false)
        {
            count += 1;
        }
    }
    Ok(count)
}

/// Database -> first non-account user granted on it.
fn parse_grants(path: &Path, source_user: &str) -> ParseResult<BTreeMap<String, String>> {
    let mut grants = BTreeMap::new();
    if !path.is_file() {
        return Ok(grants);
    }

    let re = Regex::new(r"(?i)GRANT\s+.+?\s+ON\s+[`'\x22]?([^`'\x22\s]+?)[`'\x22]?\.\*\s+TO\s+'([^']+)'")
        .map_err(|e| ParseError::malformed("mysql.sql", e.to_string()))?;

    for caps in re.captures_iter(&read_text(path)?) {
        let db = caps[1].replace("\\_", "_").replace("\\%", "%");
        let user = caps[2].to_string();
        if user == source_user || db.contains('%') {
            continue;
        }
        grants.entry(db).or_insert(user);
    }
    Ok(grants)
}

fn parse_dns(root: &Path) -> ParseResult<Vec<MigrationDnsZone>> {
    let Some(files) = list_dir(&root.join("dnszones"))? else {
        return Ok(Vec::new());
    };

    let mut zones = Vec::new();
    for file in files.into_iter().filter(|p| has_extension(p, "db")) {
        let text = read_text(&file)?;
        let (record_count, serial_number) = scan_zone(&text);
        zones.push(MigrationDnsZone {
            zone_name: file_stem(&file),
            record_count,
            serial_number,
            zone_file: relative(root, &file),
        });
    }
    Ok(zones)
}

/// Resource-record count and SOA serial of a zone file.
fn scan_zone(text: &str) -> (usize, Option<u64>) {
    let mut records = 0;
    let mut serial = None;
    let mut soa_fields: Option<Vec<String>> = None;

    for raw in text.lines() {
        let line = raw.split(';').next().unwrap_or("");
        let tokens: Vec<String> = line
            .split_whitespace()
            .map(|t| t.trim_matches(|c| c == '(' || c == ')').to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() || tokens[0].starts_with('$') {
            continue;
        }

        // continuation of a parenthesized SOA record
        if let Some(mut fields) = soa_fields.take() {
            fields.extend(tokens);
            serial = soa_serial(&fields);
            if serial.is_none() {
                soa_fields = Some(fields);
            }
            continue;
        }

        if !tokens.iter().any(|t| t.eq_ignore_ascii_case("IN")) {
            continue;
        }
        records += 1;

        if serial.is_none() {
            if let Some(pos) = tokens.iter().position(|t| t.eq_ignore_ascii_case("SOA")) {
                let fields = tokens[pos + 1..].to_vec();
                serial = soa_serial(&fields);
                if serial.is_none() {
                    soa_fields = Some(fields);
                }
            }
        }
    }

    (records, serial)
}

/// Serial is the third field after `SOA` (primary NS, contact, serial).
fn soa_serial(tokens: &[String]) -> Option<u64> {
    tokens.get(2).and_then(|t| t.parse().ok())
}

fn parse_ssl(root: &Path) -> ParseResult<(Vec<MigrationSsl>, Vec<String>)> {
    let Some(certs) = list_dir(&root.join("sslcerts"))? else {
        return Ok((Vec::new(), Vec::new()));
    };
    let keys: Vec<PathBuf> = list_dir(&root.join("sslkeys"))?
        .unwrap_or_default()
        .into_iter()
        .filter(|p| has_extension(p, "key"))
        .collect();

    let mut certificates = Vec::new();
    let mut skip_reasons = Vec::new();

    for cert in certs.into_iter().filter(|p| has_extension(p, "crt")) {
        let stem = file_stem(&cert);
        let domain = stem.split('_').next().unwrap_or(&stem).to_string();

        let key = keys
            .iter()
            .find(|k| file_stem(k) == stem)
            .or_else(|| keys.iter().find(|k| file_stem(k).starts_with(&domain)));

        if key.is_none() {
            skip_reasons.push(format!(
                "certificate for {} has no matching private key; not restored",
                domain
            ));
        }

        certificates.push(MigrationSsl {
            domain,
            certificate_file: relative(root, &cert),
            private_key_file: key.map(|k| relative(root, k)),
            has_private_key: key.is_some(),
        });
    }

    Ok((certificates, skip_reasons))
}

/// Sorted directory listing; `None` when the directory does not exist.
fn list_dir(dir: &Path) -> ParseResult<Option<Vec<PathBuf>>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ParseError::io(dir, e)),
    };
    let mut entries = Vec::new();
    for entry in rd {
        entries.push(entry.map_err(|e| ParseError::io(dir, e))?.path());
    }
    entries.sort();
    Ok(Some(entries))
}

fn read_text(path: &Path) -> ParseResult<String> {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| ParseError::io(path, e))
}

fn file_size(path: &Path) -> ParseResult<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| ParseError::io(path, e))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.is_file() && path.extension().map(|e| e == ext).unwrap_or(false)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Total bytes of regular files under `path`; symlinks are not followed.
pub fn tree_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    if !meta.is_dir() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}
