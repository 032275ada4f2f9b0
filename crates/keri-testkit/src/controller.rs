//! Controller and witness fixtures producing signed wire messages
//!
//! A [`Controller`] keeps its own view of its KEL (prefix, sequence number,
//! latest SAID, key generations) so tests can script a log one call at a
//! time. Every returned [`Message`] is fully signed; use
//! [`Controller::resign`] to strip it down to a subset of signatures.

use crate::keys::{basic_signer, key_set, verfers};
use keri_codec::{
    next_digests, receipt, Attachments, EventSeal, InceptionBuilder, InteractionBuilder, Kind,
    Message, RotationBuilder, Seal, Serder, SourceSeal, TransReceipt,
};
use keri_core::{Diger, Prefixer, Seqner, Siger, Signer};

/// Scripted identifier controller
#[derive(Debug, Clone)]
pub struct Controller {
    label: String,
    key_count: usize,
    generation: u32,
    current: Vec<Signer>,
    next: Vec<Signer>,
    prefix: Option<Prefixer>,
    sn: u64,
    last_said: Option<Diger>,
    last_establishment: Option<(u64, Diger)>,
    witnesses: Vec<Prefixer>,
    kind: Kind,
}

impl Controller {
    /// Controller with `key_count` keys per generation
    pub fn new(label: &str, key_count: usize) -> Self {
        Self {
            label: label.to_string(),
            key_count,
            generation: 0,
            current: key_set(label, 0, key_count),
            next: key_set(label, 1, key_count),
            prefix: None,
            sn: 0,
            last_said: None,
            last_establishment: None,
            witnesses: Vec::new(),
            kind: Kind::Json,
        }
    }

    /// Serialize this controller's events as `kind`
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Identifier, once incepted
    pub fn prefix(&self) -> Prefixer {
        self.prefix.clone().expect("controller not incepted")
    }

    /// Sequence number of the latest event
    pub fn sn(&self) -> u64 {
        self.sn
    }

    /// SAID of the latest event
    pub fn last_said(&self) -> Diger {
        self.last_said.clone().expect("controller not incepted")
    }

    /// Signers of the current key generation
    pub fn signers(&self) -> &[Signer] {
        &self.current
    }

    /// Signers committed to as next keys
    pub fn next_signers(&self) -> &[Signer] {
        &self.next
    }

    /// Witnesses in force
    pub fn witnesses(&self) -> &[Prefixer] {
        &self.witnesses
    }

    /// Event seal pointing at the latest event
    pub fn seal(&self) -> Seal {
        Seal::Event(EventSeal::new(&self.prefix(), self.sn, &self.last_said()))
    }

    /// Source seal couple pointing at the latest event
    pub fn source_seal(&self) -> SourceSeal {
        SourceSeal {
            seqner: Seqner(u128::from(self.sn)),
            said: self.last_said(),
        }
    }

    /// Incept with default thresholds and no witnesses
    pub fn incept(&mut self) -> Message {
        self.incept_with(|builder| builder)
    }

    /// Incept, letting `configure` adjust the builder
    pub fn incept_with(
        &mut self,
        configure: impl FnOnce(InceptionBuilder) -> InceptionBuilder,
    ) -> Message {
        let builder = InceptionBuilder::new(verfers(&self.current))
            .with_next(next_digests(&verfers(&self.next)))
            .with_kind(self.kind);
        let serder = configure(builder).build().expect("inception builds");
        let event = serder.key_event().expect("inception decodes");
        self.prefix = Some(event.prefix.clone());
        self.sn = 0;
        self.last_said = Some(event.said.clone());
        self.last_establishment = Some((0, event.said.clone()));
        if let keri_codec::EventKind::Inception(icp)
        | keri_codec::EventKind::DelegatedInception { inception: icp, .. } = &event.kind
        {
            self.witnesses = icp.witnesses.clone();
        }
        sign_all(serder, &self.current)
    }

    /// Rotate to the committed next keys with default settings
    pub fn rotate(&mut self) -> Message {
        self.rotate_with(|builder| builder)
    }

    /// Rotate to the committed next keys, letting `configure` adjust the builder
    pub fn rotate_with(
        &mut self,
        configure: impl FnOnce(RotationBuilder) -> RotationBuilder,
    ) -> Message {
        self.generation += 1;
        let upcoming = key_set(&self.label, self.generation + 1, self.key_count);
        let builder = RotationBuilder::new(
            self.prefix(),
            self.sn + 1,
            self.last_said(),
            verfers(&self.next),
        )
        .with_next(next_digests(&verfers(&upcoming)))
        .with_current_witnesses(self.witnesses.clone())
        .with_kind(self.kind);
        let serder = configure(builder).build().expect("rotation builds");
        let event = serder.key_event().expect("rotation decodes");

        self.current = std::mem::replace(&mut self.next, upcoming);
        self.sn = event.sn;
        self.last_said = Some(event.said.clone());
        self.last_establishment = Some((event.sn, event.said.clone()));
        if let keri_codec::EventKind::Rotation(rot) | keri_codec::EventKind::DelegatedRotation(rot) =
            &event.kind
        {
            self.witnesses.retain(|w| !rot.cuts.contains(w));
            self.witnesses.extend(rot.adds.iter().cloned());
        }
        sign_all(serder, &self.current)
    }

    /// Anchor `seals` in an interaction event
    pub fn interact(&mut self, seals: Vec<Seal>) -> Message {
        let serder = InteractionBuilder::new(self.prefix(), self.sn + 1, self.last_said())
            .with_seals(seals)
            .with_kind(self.kind)
            .build()
            .expect("interaction builds");
        let event = serder.key_event().expect("interaction decodes");
        self.sn = event.sn;
        self.last_said = Some(event.said.clone());
        sign_all(serder, &self.current)
    }

    /// `message` with only the current-key signatures at `indices`
    pub fn resign(&self, message: &Message, indices: &[u32]) -> Message {
        let controller_sigs = indices
            .iter()
            .map(|i| {
                self.current[*i as usize]
                    .sign_indexed(message.serder.raw(), *i)
                    .expect("index fits")
            })
            .collect();
        Message {
            serder: message.serder.clone(),
            attachments: Attachments {
                controller_sigs,
                ..message.attachments.clone()
            },
        }
    }

    /// Transferable receipt of `event` by this controller's latest establishment keys
    pub fn trans_receipt(&self, event: &Serder) -> Message {
        let (sn, said) = self
            .last_establishment
            .clone()
            .expect("controller not incepted");
        let trans_receipts = self
            .current
            .iter()
            .enumerate()
            .map(|(i, signer)| TransReceipt {
                prefix: self.prefix(),
                seqner: Seqner(u128::from(sn)),
                said: said.clone(),
                siger: signer
                    .sign_indexed(event.raw(), i as u32)
                    .expect("index fits"),
            })
            .collect();
        receipt_message(
            event,
            Attachments {
                trans_receipts,
                ..Attachments::default()
            },
        )
    }
}

/// Sign `serder` with every signer at its position
pub fn sign_all(serder: Serder, signers: &[Signer]) -> Message {
    let controller_sigs = signers
        .iter()
        .enumerate()
        .map(|(i, s)| s.sign_indexed(serder.raw(), i as u32).expect("index fits"))
        .collect();
    Message {
        serder,
        attachments: Attachments {
            controller_sigs,
            ..Attachments::default()
        },
    }
}

fn receipt_message(event: &Serder, attachments: Attachments) -> Message {
    let serder = receipt(
        &event.prefix().expect("event prefix"),
        event.sn().expect("event sn"),
        &event.said().expect("event said"),
        event.kind(),
    )
    .expect("receipt builds");
    Message {
        serder,
        attachments,
    }
}

/// Scripted non-transferable witness
#[derive(Debug, Clone)]
pub struct Witness {
    signer: Signer,
}

impl Witness {
    /// Witness with keys derived from `label`
    pub fn new(label: &str) -> Self {
        Self {
            signer: basic_signer(label, 0),
        }
    }

    /// Identifier of this witness
    pub fn prefix(&self) -> Prefixer {
        Prefixer::basic(self.signer.verfer())
    }

    /// Indexed signature over `event` at witness list position `index`
    pub fn wig(&self, event: &Serder, index: u32) -> Siger {
        self.signer
            .sign_indexed(event.raw(), index)
            .expect("index fits")
    }

    /// `rct` message with a receipt couple
    pub fn receipt(&self, event: &Serder) -> Message {
        receipt_message(
            event,
            Attachments {
                receipts: vec![self.signer.sign(event.raw())],
                ..Attachments::default()
            },
        )
    }

    /// `rct` message with an indexed witness signature
    pub fn indexed_receipt(&self, event: &Serder, index: u32) -> Message {
        receipt_message(
            event,
            Attachments {
                witness_sigs: vec![self.wig(event, index)],
                ..Attachments::default()
            },
        )
    }
}

/// Wire bytes of `message`
pub fn bytes(message: &Message) -> Vec<u8> {
    message.to_bytes(false).expect("message encodes")
}

/// Wire bytes of several messages back to back
pub fn stream(messages: &[Message]) -> Vec<u8> {
    messages.iter().flat_map(bytes).collect()
}
