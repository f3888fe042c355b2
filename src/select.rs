//! Application selection: candidate list construction (PSE directory or
//! brute-force AID list), priority ordering and cardholder selection.
//!
//! EMV Book 1, Section 12. The terminal first tries the card's own
//! directory (the PSE); if the card has none, it probes every AID the
//! terminal supports, enumerating partial matches with SELECT "next
//! occurrence". Either way the result is a deduplicated candidate list,
//! priority-sorted, from which the cardholder (or the kernel, if there is
//! nothing to choose) picks the application to run.

use tracing::{debug, trace_span, warn};

use crate::errors::{Error, Fatal, Result, Soft};
use crate::tags;
use crate::tal::{DirectoryEntry, Fci, Tal};
use crate::tlv::{Field, TlvList, FLAG_MATCH_PARTIAL};
use crate::ttl::{CardReader, Sw};

/// An AID the terminal supports, and how strictly it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedAid {
    pub aid: Vec<u8>,
    /// Partial match: ours may be a prefix of the card's ADF name.
    pub partial: bool,
}

impl SupportedAid {
    pub fn exact<T: Into<Vec<u8>>>(aid: T) -> Self {
        SupportedAid { aid: aid.into(), partial: false }
    }

    pub fn partial<T: Into<Vec<u8>>>(aid: T) -> Self {
        SupportedAid { aid: aid.into(), partial: true }
    }

    /// Does a card AID match this entry under its matching mode?
    pub fn matches(&self, card_aid: &[u8]) -> bool {
        if self.partial {
            card_aid.starts_with(&self.aid)
        } else {
            card_aid == self.aid
        }
    }

    /// Read the supported set out of a terminal config list: every 9F06
    /// field, with the partial-match mode carried in the field flags.
    pub fn from_config(config: &TlvList) -> Vec<SupportedAid> {
        config
            .iter()
            .filter(|f| f.tag == tags::AID_TERMINAL)
            .map(|f| SupportedAid {
                aid: f.value.clone(),
                partial: f.flags & FLAG_MATCH_PARTIAL != 0,
            })
            .collect()
    }
}

/// One candidate application, as discovered on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub aid: Vec<u8>,
    /// UTF-8 display name for the cardholder.
    pub name: String,
    /// Application Priority Indicator low nibble; 0 = unspecified.
    pub priority: u8,
    /// The priority indicator's high bit: selection needs explicit
    /// cardholder confirmation.
    pub confirm: bool,
    /// FCI-derived fields this candidate was built from.
    pub fields: TlvList,
}

/// Decode an application label. The Application Preferred Name wins when
/// its Issuer Code Table (an ISO 8859 part) is one we can decode;
/// otherwise the plain label, which is common character set (a subset of
/// ASCII). Falls back to the hex AID when the card names nothing.
fn display_name(
    aid: &[u8],
    label: Option<&[u8]>,
    preferred: Option<&[u8]>,
    code_table: Option<u8>,
) -> String {
    if let (Some(preferred), Some(table)) = (preferred, code_table) {
        let encoding_label = format!("iso-8859-{}", table);
        if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_label.as_bytes()) {
            let (name, _, _) = encoding.decode(preferred);
            return name.into_owned();
        }
        debug!("no decoder for issuer code table {}", table);
    }
    match label {
        Some(label) => String::from_utf8_lossy(label).into_owned(),
        None => hex::encode(aid),
    }
}

fn split_priority(indicator: Option<u8>) -> (u8, bool) {
    match indicator {
        Some(b) => (b & 0x0F, b & 0x80 != 0),
        None => (0, false),
    }
}

impl Candidate {
    fn from_directory_entry(entry: &DirectoryEntry) -> Candidate {
        let (priority, confirm) = split_priority(entry.priority);
        let name = display_name(
            &entry.aid,
            entry.label.as_deref(),
            entry.preferred_name.as_deref(),
            entry.code_table,
        );
        let mut fields = TlvList::new();
        fields.push(Field::new(tags::ADF_NAME, entry.aid.clone()));
        if let Some(label) = &entry.label {
            fields.push(Field::new(tags::APP_LABEL, label.clone()));
        }
        if let Some(preferred) = &entry.preferred_name {
            fields.push(Field::new(tags::APP_PREFERRED_NAME, preferred.clone()));
        }
        if let Some(table) = entry.code_table {
            fields.push(Field::new(tags::ISSUER_CODE_TABLE, vec![table]));
        }
        if let Some(indicator) = entry.priority {
            fields.push(Field::new(tags::APP_PRIORITY, vec![indicator]));
        }
        Candidate {
            aid: entry.aid.clone(),
            name,
            priority,
            confirm,
            fields,
        }
    }

    fn from_fci(fci: &Fci) -> Candidate {
        let indicator = match fci.fields.value(tags::APP_PRIORITY) {
            Some([b]) => Some(*b),
            _ => None,
        };
        let (priority, confirm) = split_priority(indicator);
        let code_table = match fci.fields.value(tags::ISSUER_CODE_TABLE) {
            Some([b]) => Some(*b),
            _ => None,
        };
        let name = display_name(
            &fci.df_name,
            fci.fields.value(tags::APP_LABEL),
            fci.fields.value(tags::APP_PREFERRED_NAME),
            code_table,
        );
        Candidate {
            aid: fci.df_name.clone(),
            name,
            priority,
            confirm,
            fields: fci.fields.clone(),
        }
    }
}

/// The candidate list: insertion-ordered, owning its applications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateList {
    apps: Vec<Candidate>,
}

impl CandidateList {
    pub fn new() -> Self {
        CandidateList::default()
    }

    /// Append, dropping exact-AID duplicates (first discovery wins).
    pub fn push(&mut self, candidate: Candidate) {
        if self.apps.iter().any(|c| c.aid == candidate.aid) {
            debug!("duplicate candidate {} dropped", hex::encode(&candidate.aid));
            return;
        }
        self.apps.push(candidate);
    }

    pub fn remove(&mut self, index: usize) -> Option<Candidate> {
        (index < self.apps.len()).then(|| self.apps.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&Candidate> {
        self.apps.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.apps.iter()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn clear(&mut self) {
        self.apps.clear();
    }

    /// Stable priority sort: indicated priorities ascending (1 is best),
    /// applications without an indicator after all indicated ones, in
    /// their discovery order.
    pub fn sort_by_priority(&mut self) {
        self.apps
            .sort_by_key(|c| if c.priority == 0 { 0x10 } else { c.priority });
    }

    /// Must the cardholder confirm the selection? Yes when any candidate
    /// demands confirmation, or there is more than one to choose from.
    pub fn needs_confirmation(&self) -> bool {
        self.apps.len() > 1 || self.apps.iter().any(|c| c.confirm)
    }
}

impl<'a> IntoIterator for &'a CandidateList {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.apps.iter()
    }
}

/// Outcome of selecting one candidate (§ spec: continuable failures drop
/// the candidate so the cardholder can pick again).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Selected and FCI-validated; transaction may begin.
    Selected(Fci),
    /// The candidate was no good and has been removed; choose again.
    TryAgain,
    /// No candidates remain: the card is not accepted.
    NotAccepted,
    /// The card is blocked. Terminate the session.
    CardBlocked,
    /// Reader-level failure. Terminate the session.
    CardError,
}

/// Selection state, driven by [`ApplicationSelection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    BuildingCandidates,
    CandidatesReady,
    AppSelected,
    Terminated,
}

/// The application selection state machine.
#[derive(Debug)]
pub struct ApplicationSelection {
    state: State,
    candidates: CandidateList,
    languages: Option<String>,
}

impl Default for ApplicationSelection {
    fn default() -> Self {
        ApplicationSelection::new()
    }
}

impl ApplicationSelection {
    pub fn new() -> Self {
        ApplicationSelection {
            state: State::Init,
            candidates: CandidateList::new(),
            languages: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn candidates(&self) -> &CandidateList {
        &self.candidates
    }

    /// The card's Language Preference (5F2D) from the PSE, for the UI.
    pub fn languages(&self) -> Option<&str> {
        self.languages.as_deref()
    }

    /// Build the candidate list: PSE first, AID probing as fallback.
    /// After this the list is deduplicated and priority-sorted.
    pub fn build<R: CardReader>(
        &mut self,
        tal: &mut Tal<R>,
        supported: &[SupportedAid],
    ) -> Result<&CandidateList> {
        let span = trace_span!("build_candidates");
        let _enter = span.enter();

        self.state = State::BuildingCandidates;
        self.candidates.clear();
        self.languages = None;

        match build_from_pse(tal, supported, &mut self.candidates, &mut self.languages) {
            Ok(()) => {}
            Err(Error::Soft(soft)) => {
                debug!("PSE discovery unavailable ({}), probing AID list", soft);
            }
            Err(fatal) => {
                self.state = State::Terminated;
                return Err(fatal);
            }
        }

        if self.candidates.is_empty() {
            if let Err(e) = build_from_aid_list(tal, supported, &mut self.candidates) {
                self.state = State::Terminated;
                return Err(e);
            }
        }

        self.candidates.sort_by_priority();
        self.state = State::CandidatesReady;
        if self.candidates.is_empty() {
            return Err(Soft::AppNotFound.into());
        }
        Ok(&self.candidates)
    }

    pub fn needs_confirmation(&self) -> bool {
        self.candidates.needs_confirmation()
    }

    /// Select the candidate at `index`. Continuable failures remove the
    /// candidate and ask the caller to try again; fatal failures
    /// terminate the selection.
    pub fn select<R: CardReader>(&mut self, tal: &mut Tal<R>, index: usize) -> Outcome {
        let span = trace_span!("select_candidate", index = index);
        let _enter = span.enter();

        let Some(candidate) = self.candidates.get(index) else {
            warn!("selection index {} out of range", index);
            self.state = State::Terminated;
            return Outcome::CardError;
        };
        let aid = candidate.aid.clone();

        match tal.select_application(&aid) {
            Ok(fci) => {
                self.state = State::AppSelected;
                Outcome::Selected(fci)
            }
            Err(Error::Soft(soft)) => {
                debug!("candidate {} rejected: {}", hex::encode(&aid), soft);
                self.candidates.remove(index);
                if self.candidates.is_empty() {
                    self.state = State::Terminated;
                    Outcome::NotAccepted
                } else {
                    Outcome::TryAgain
                }
            }
            Err(Error::Fatal(Fatal::CardBlocked)) => {
                self.candidates.remove(index);
                self.state = State::Terminated;
                Outcome::CardBlocked
            }
            Err(Error::Fatal(e)) => {
                warn!("selection failed fatally: {}", e);
                self.state = State::Terminated;
                Outcome::CardError
            }
        }
    }

    /// Abort selection and drop every candidate.
    pub fn terminate(&mut self) {
        self.candidates.clear();
        self.state = State::Terminated;
    }
}

fn build_from_pse<R: CardReader>(
    tal: &mut Tal<R>,
    supported: &[SupportedAid],
    out: &mut CandidateList,
    languages: &mut Option<String>,
) -> Result<()> {
    let dir = tal.read_pse()?;
    *languages = dir.languages.clone();
    let entries = tal.read_pse_entries(&dir)?;
    for entry in &entries {
        if supported.iter().any(|s| s.matches(&entry.aid)) {
            out.push(Candidate::from_directory_entry(entry));
        } else {
            debug!("directory offers unsupported AID {}", hex::encode(&entry.aid));
        }
    }
    Ok(())
}

fn build_from_aid_list<R: CardReader>(
    tal: &mut Tal<R>,
    supported: &[SupportedAid],
    out: &mut CandidateList,
) -> Result<()> {
    let span = trace_span!("probe_aid_list");
    let _enter = span.enter();

    for entry in supported {
        let mut next = false;
        loop {
            let rsp = tal.select_df(&entry.aid, next)?;
            match rsp.sw {
                Sw::OK => {}
                Sw::FILE_NOT_FOUND => break,
                sw => {
                    debug!("probe of {} refused: SW {}", hex::encode(&entry.aid), sw);
                    break;
                }
            }
            match crate::tal::parse_candidate_fci(&rsp.data) {
                Ok(fci) if entry.matches(&fci.df_name) => {
                    out.push(Candidate::from_fci(&fci));
                }
                Ok(fci) => {
                    debug!(
                        "card returned non-matching DF {} for {}",
                        hex::encode(&fci.df_name),
                        hex::encode(&entry.aid)
                    );
                    break;
                }
                Err(e) => {
                    warn!("undecodable FCI while probing: {}", e);
                    break;
                }
            }
            if !entry.partial {
                break;
            }
            // Enumerate further matches with SELECT "next occurrence".
            next = true;
        }
    }
    Ok(())
}
